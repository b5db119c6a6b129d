//! Parsing of RTM_GET* dump responses.

use winnow::binary::le_u16;
use winnow::prelude::*;
use winnow::token::take;

use super::attr::NLA_TYPE_MASK;
use super::message::NLMSG_HDRLEN;
use super::tcmsg::{
    TCA_KIND, TCA_STATS, TCA_STATS2, TCA_STATS_BASIC, TCA_STATS_PKT64, TCA_STATS_QUEUE, TCMSG_LEN,
    TcMsg,
};
use crate::adapter::TrafficCounters;

type PResult<T> = winnow::ModalResult<T>;

/// A qdisc, class or filter message from a kernel dump.
#[derive(Debug, Clone, Default)]
pub struct TcDumpMessage {
    /// The fixed `tcmsg` header.
    pub header: TcMsg,
    /// Object kind ("htb", "u32", ...).
    pub kind: Option<String>,
    /// Counters assembled from TCA_STATS2 (or the legacy TCA_STATS).
    pub stats: TrafficCounters,
}

impl TcDumpMessage {
    /// Parse one full message (netlink header included).
    pub fn parse(message: &[u8]) -> Option<Self> {
        if message.len() < NLMSG_HDRLEN {
            return None;
        }
        let mut payload = &message[NLMSG_HDRLEN..];
        parse_payload(&mut payload).ok()
    }
}

fn parse_payload(input: &mut &[u8]) -> PResult<TcDumpMessage> {
    let header_bytes: &[u8] = take(TCMSG_LEN).parse_next(input)?;
    let header = *TcMsg::from_bytes(header_bytes).ok_or_else(|| {
        winnow::error::ErrMode::Cut(winnow::error::ContextError::new())
    })?;

    let mut msg = TcDumpMessage {
        header,
        ..Default::default()
    };

    while input.len() >= 4 {
        let len = le_u16.parse_next(input)? as usize;
        let attr_type = le_u16.parse_next(input)?;
        if len < 4 {
            break;
        }

        let payload_len = len - 4;
        if input.len() < payload_len {
            break;
        }
        let attr_data: &[u8] = take(payload_len).parse_next(input)?;

        // Skip alignment padding between attributes.
        let padding = ((len + 3) & !3) - len;
        if input.len() >= padding {
            let _: &[u8] = take(padding).parse_next(input)?;
        }

        match attr_type & NLA_TYPE_MASK {
            TCA_KIND => {
                let end = attr_data
                    .iter()
                    .position(|b| *b == 0)
                    .unwrap_or(attr_data.len());
                msg.kind = Some(String::from_utf8_lossy(&attr_data[..end]).to_string());
            }
            TCA_STATS2 => parse_stats2(&mut msg.stats, attr_data),
            TCA_STATS => parse_legacy_stats(&mut msg.stats, attr_data),
            _ => {}
        }
    }

    Ok(msg)
}

/// Walk the nested TCA_STATS2 attributes.
fn parse_stats2(stats: &mut TrafficCounters, data: &[u8]) {
    let mut input = data;
    while input.len() >= 4 {
        let len = u16::from_ne_bytes(input[..2].try_into().unwrap()) as usize;
        let attr_type = u16::from_ne_bytes(input[2..4].try_into().unwrap());
        if len < 4 || input.len() < len {
            break;
        }
        let payload = &input[4..len];

        match attr_type & NLA_TYPE_MASK {
            TCA_STATS_BASIC => {
                // struct gnet_stats_basic: u64 bytes, u32 packets.
                if payload.len() >= 12 {
                    stats.bytes = u64::from_ne_bytes(payload[..8].try_into().unwrap());
                    stats.packets =
                        u32::from_ne_bytes(payload[8..12].try_into().unwrap()) as u64;
                }
            }
            TCA_STATS_PKT64 => {
                if payload.len() >= 8 {
                    stats.packets = u64::from_ne_bytes(payload[..8].try_into().unwrap());
                }
            }
            TCA_STATS_QUEUE => {
                // struct gnet_stats_queue: qlen, backlog, drops, requeues,
                // overlimits.
                if payload.len() >= 20 {
                    stats.qlen = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
                    stats.backlog = u32::from_ne_bytes(payload[4..8].try_into().unwrap());
                    stats.drops = u32::from_ne_bytes(payload[8..12].try_into().unwrap());
                    stats.requeues = u32::from_ne_bytes(payload[12..16].try_into().unwrap());
                    stats.overlimits = u32::from_ne_bytes(payload[16..20].try_into().unwrap());
                }
            }
            _ => {}
        }

        let aligned = (len + 3) & !3;
        if input.len() <= aligned {
            break;
        }
        input = &input[aligned..];
    }
}

/// Legacy `struct tc_stats` fallback.
fn parse_legacy_stats(stats: &mut TrafficCounters, data: &[u8]) {
    if data.len() < 36 {
        return;
    }
    stats.bytes = u64::from_ne_bytes(data[0..8].try_into().unwrap());
    stats.packets = u32::from_ne_bytes(data[8..12].try_into().unwrap()) as u64;
    stats.drops = u32::from_ne_bytes(data[12..16].try_into().unwrap());
    stats.overlimits = u32::from_ne_bytes(data[16..20].try_into().unwrap());
    stats.qlen = u32::from_ne_bytes(data[28..32].try_into().unwrap());
    stats.backlog = u32::from_ne_bytes(data[32..36].try_into().unwrap());
}

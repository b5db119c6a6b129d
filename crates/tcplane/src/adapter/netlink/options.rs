//! Translate domain entities into TC option attributes.

use zerocopy::IntoBytes as _;

use super::builder::MessageBuilder;
use super::tcmsg::*;
use crate::adapter::{AdapterError, AdapterResult};
use crate::domain::{Bandwidth, Filter, HtbClass, Match, QdiscSpec, derive_burst};

/// Kernel tick rate assumed for buffer conversion.
const HZ: u64 = 1_000;

/// Time units per second in rate tables and buffer values.
const TIME_UNITS_PER_SEC: u64 = 1_000_000;

/// MTU assumed when computing rate tables.
const RTAB_MTU: u32 = 1_600;

/// Convert a token buffer in bytes into ticks for the given rate.
fn buffer_ticks(bytes: u32, rate: Bandwidth) -> u32 {
    let bps = rate.bytes_per_second();
    if bps == 0 {
        return bytes;
    }
    u32::try_from(bytes as u64 * TIME_UNITS_PER_SEC / bps).unwrap_or(u32::MAX)
}

/// Transmission-time lookup table for a rate, one entry per 8-byte cell.
fn compute_rate_table(rate: Bandwidth, mtu: u32) -> [u8; 1024] {
    let mut table = [0u8; 1024];
    let bps = rate.bytes_per_second();
    if bps == 0 {
        return table;
    }

    let cell_log: u32 = 3;
    let cell_size = 1u32 << cell_log;

    for i in 0..256 {
        let size = ((i + 1) as u32 * cell_size).min(mtu);
        let time = (size as u64 * TIME_UNITS_PER_SEC / bps).min(u32::MAX as u64) as u32;
        table[i * 4..i * 4 + 4].copy_from_slice(&time.to_ne_bytes());
    }

    table
}

/// Write a qdisc's TCA_KIND and TCA_OPTIONS attributes.
pub fn write_qdisc_options(builder: &mut MessageBuilder, spec: &QdiscSpec) {
    match spec {
        QdiscSpec::Htb { default_class, r2q } => {
            let options = builder.nest_start(TCA_OPTIONS);
            let glob = TcHtbGlob {
                version: TC_HTB_PROTOVER,
                rate2quantum: *r2q,
                defcls: default_class.minor() as u32,
                ..Default::default()
            };
            builder.append_attr(TCA_HTB_INIT, glob.as_bytes());
            builder.nest_end(options);
        }
        QdiscSpec::Tbf {
            rate,
            buffer,
            limit,
            burst,
        } => {
            // A zero burst derives from the rate like HTB does.
            let burst = if *burst == 0 {
                (rate.bytes_per_second() / HZ + RTAB_MTU as u64) as u32
            } else {
                *burst
            };
            // The qopt buffer field is in ticks; the caller's buffer bytes
            // win when set, otherwise the derived burst is used.
            let buffer_bytes = if *buffer == 0 { burst } else { *buffer };

            let options = builder.nest_start(TCA_OPTIONS);
            let qopt = TcTbfQopt {
                rate: TcRateSpec::from_bytes_per_second(rate.bytes_per_second()),
                peakrate: TcRateSpec::default(),
                limit: *limit,
                buffer: buffer_ticks(buffer_bytes, *rate),
                mtu: RTAB_MTU,
            };
            builder.append_attr(TCA_TBF_PARMS, qopt.as_bytes());
            builder.append_attr(TCA_TBF_BURST, &burst.to_ne_bytes());
            builder.append_attr(TCA_TBF_RTAB, &compute_rate_table(*rate, RTAB_MTU));
            builder.nest_end(options);
        }
        QdiscSpec::Prio { bands, priomap } => {
            // PRIO options are the bare struct, not nested attributes.
            let qopt = TcPrioQopt {
                bands: *bands as i32,
                priomap: *priomap,
            };
            builder.append_attr(TCA_OPTIONS, qopt.as_bytes());
        }
        QdiscSpec::FqCodel {
            limit,
            flows,
            target,
            interval,
            quantum,
            ecn,
        } => {
            let options = builder.nest_start(TCA_OPTIONS);
            builder.append_attr_u32(TCA_FQ_CODEL_LIMIT, *limit);
            builder.append_attr_u32(TCA_FQ_CODEL_FLOWS, *flows);
            builder.append_attr_u32(TCA_FQ_CODEL_TARGET, *target);
            builder.append_attr_u32(TCA_FQ_CODEL_INTERVAL, *interval);
            builder.append_attr_u32(TCA_FQ_CODEL_QUANTUM, *quantum);
            builder.append_attr_u32(TCA_FQ_CODEL_ECN, u32::from(*ecn));
            builder.nest_end(options);
        }
    }
}

/// Write an HTB class's TCA_OPTIONS attributes.
pub fn write_class_options(builder: &mut MessageBuilder, class: &HtbClass) {
    let rate_bps = class.rate.bytes_per_second();
    // The kernel clamps ceil below rate to rate; do it up front.
    let ceil = class.ceil.max(class.rate);
    let ceil_bps = ceil.bytes_per_second();

    let burst = if class.burst == 0 {
        derive_burst(class.rate)
    } else {
        class.burst
    };
    let cburst = if class.cburst == 0 {
        derive_burst(ceil)
    } else {
        class.cburst
    };

    let options = builder.nest_start(TCA_OPTIONS);

    // 64-bit rates ride in their own attributes; the parms rate saturates.
    if rate_bps > u32::MAX as u64 {
        builder.append_attr(TCA_HTB_RATE64, &rate_bps.to_ne_bytes());
    }
    if ceil_bps > u32::MAX as u64 {
        builder.append_attr(TCA_HTB_CEIL64, &ceil_bps.to_ne_bytes());
    }

    let opt = TcHtbOpt {
        rate: TcRateSpec::from_bytes_per_second(rate_bps),
        ceil: TcRateSpec::from_bytes_per_second(ceil_bps),
        buffer: buffer_ticks(burst, class.rate),
        cbuffer: buffer_ticks(cburst, ceil),
        prio: class.priority.map(|p| p.value() as u32).unwrap_or(0),
        ..Default::default()
    };
    builder.append_attr(TCA_HTB_PARMS, opt.as_bytes());
    builder.append_attr(TCA_HTB_RTAB, &compute_rate_table(class.rate, RTAB_MTU));
    builder.append_attr(TCA_HTB_CTAB, &compute_rate_table(ceil, RTAB_MTU));

    builder.nest_end(options);
}

// IPv4 header byte offsets for u32 keys.
const IP_OFF_TOS_PROTO_WORD: i32 = 8; // protocol byte lives at offset 9
const IP_OFF_SRC: i32 = 12;
const IP_OFF_DST: i32 = 16;
// Transport header offset, assuming no IP options (iproute2's simple
// match form does the same).
const IP_OFF_TRANSPORT: i32 = 20;

/// The u32 node handle for a filter, in the default hash table's hex
/// domain (`0x800:node`).
pub fn u32_filter_handle(node: u16) -> u32 {
    (U32_DEFAULT_HTID << 20) | node as u32
}

/// Write a u32 filter's TCA_OPTIONS: the flow target plus one selector
/// key per match.
pub fn write_u32_options(builder: &mut MessageBuilder, filter: &Filter) -> AdapterResult<()> {
    let mut sel = TcU32Sel::new();
    for m in &filter.matches {
        match m {
            Match::IpSource(cidr) => {
                sel.push(TcU32Key::new(
                    u32::from_be_bytes(cidr.addr().octets()),
                    cidr.mask(),
                    IP_OFF_SRC,
                ));
            }
            Match::IpDestination(cidr) => {
                sel.push(TcU32Key::new(
                    u32::from_be_bytes(cidr.addr().octets()),
                    cidr.mask(),
                    IP_OFF_DST,
                ));
            }
            Match::PortSource(port) => {
                sel.push(TcU32Key::new(
                    (*port as u32) << 16,
                    0xFFFF_0000,
                    IP_OFF_TRANSPORT,
                ));
            }
            Match::PortDestination(port) => {
                sel.push(TcU32Key::new(*port as u32, 0x0000_FFFF, IP_OFF_TRANSPORT));
            }
            Match::Protocol(proto) => {
                // Protocol is the low byte of the word at offset 8.
                sel.push(TcU32Key::new(
                    proto.number() as u32,
                    0x0000_00FF,
                    IP_OFF_TOS_PROTO_WORD,
                ));
            }
            Match::Mark { .. } => {
                return Err(AdapterError::KernelRejected(
                    "mark matches compile to the fw classifier".to_string(),
                ));
            }
        }
    }

    builder.append_attr_u32(TCA_U32_CLASSID, filter.flow_id.as_u32());
    // An empty selector still terminates: it matches every packet.
    builder.append_attr(TCA_U32_SEL, &sel.to_bytes());
    Ok(())
}

/// Write a fw filter's TCA_OPTIONS. The mark value itself travels in
/// `tcm_handle`, which the caller packs when it builds the message header.
pub fn write_fw_options(builder: &mut MessageBuilder, filter: &Filter) -> AdapterResult<()> {
    let Some(Match::Mark { mask, .. }) = filter.matches.first() else {
        return Err(AdapterError::KernelRejected(
            "fw classifier needs a mark match".to_string(),
        ));
    };
    builder.append_attr_u32(TCA_FW_CLASSID, filter.flow_id.as_u32());
    builder.append_attr_u32(TCA_FW_MASK, *mask);
    Ok(())
}

//! RLE decoder (spec §4.4.3): per-pod register-level download and the
//! four-stage post-processing pipeline (rotate, time-unwrap, time-cull,
//! trigger-offset compensation).

use tracing::warn;

use crate::error::{SumpError, SumpResult};

/// One decoded RAM row before post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RleRow {
    pub code: u8,
    pub time: u64,
    pub data: u32,
}

impl RleRow {
    /// "<code> <time_hex> <data_hex>" per spec §4.4.3 step 4.
    pub fn to_line(&self, ts_bits: u8, data_bits: u8) -> String {
        format!(
            "{} {:0twidth$x} {:0dwidth$x}",
            self.code,
            self.time,
            self.data,
            twidth = ts_bits.div_ceil(4) as usize,
            dwidth = data_bits.div_ceil(4) as usize,
        )
    }
}

/// A fully post-processed sample, ready for text emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RleSample {
    pub code: u8,
    pub data: u32,
    pub time_ps: i64,
}

impl RleSample {
    /// "<data_bits_lsb_first> <code> <signed_time_ps>" with masked bits as 'X'.
    pub fn to_line(&self, data_bits: u8, bit_mask: u32) -> String {
        let mut bits = String::with_capacity(data_bits as usize);
        for bit in 0..data_bits {
            let masked = (bit_mask >> bit) & 1 != 0;
            if masked {
                bits.push('X');
            } else {
                bits.push(if (self.data >> bit) & 1 != 0 { '1' } else { '0' });
            }
        }
        format!("{bits} {} {}", self.code, self.time_ps)
    }
}

/// Geometry needed to unpack register-level pages into rows, and the
/// latency terms for trigger-offset compensation.
#[derive(Debug, Clone, Copy)]
pub struct RleParams {
    pub ts_bits: u8,
    pub data_bits: u8,
    pub clock_ps: i64,
    pub trigger_miso_latency_ps: i64,
    pub pod_core_clock_ps: i64,
    pub trigger_core_cycles: i64,
    pub trigger_mosi_cycles: i64,
    pub bit_mask: u32,
}

/// Unpack `num_pages` pages of `depth` DWORDs each into rows of
/// `{ code[1:0], time[t-1:0], data[d-1:0] }`, packed MSB-first across the
/// page concatenation (spec §4.4.3 step 2-3). A page's row data is not
/// necessarily nibble-aligned to `data_bits`; splitting data from the
/// shared code+timestamp field by masking low `data_bits` bits off the
/// concatenated value is equivalent to, but simpler than, the nibble-mask
/// construction described for printing (spec B1).
pub fn unpack_rows(pages: &[Vec<u32>], depth: usize, ts_bits: u8, data_bits: u8) -> Vec<RleRow> {
    let total_bits = 2usize + ts_bits as usize + data_bits as usize;
    let padded_bits = pages.len() * 32;
    let pad = padded_bits.saturating_sub(total_bits);

    let mut rows = Vec::with_capacity(depth);
    for r in 0..depth {
        let mut combined: u128 = 0;
        for page in pages {
            combined = (combined << 32) | page[r] as u128;
        }
        combined >>= pad;

        let data_mask = (1u128 << data_bits) - 1;
        let data = (combined & data_mask) as u32;
        let rest = combined >> data_bits;

        let ts_mask = (1u128 << ts_bits) - 1;
        let time = (rest & ts_mask) as u64;
        let code = ((rest >> ts_bits) & 0x3) as u8;

        rows.push(RleRow { code, time, data });
    }
    rows
}

/// Phase (a): rotate so the window starts at the first pre-trigger sample
/// following the trigger (falling back to the trigger itself).
fn rotate(mut rows: Vec<RleRow>, hub: u8, pod: u8) -> SumpResult<Vec<RleRow>> {
    let len = rows.len();
    let trigger_idx = rows.iter().position(|r| r.code == 2).ok_or_else(|| SumpError::SampleDecode {
        hub,
        pod,
        message: "no trigger marker found in RLE capture".to_string(),
    })?;

    let rotate_at = (trigger_idx..trigger_idx + len)
        .find(|&i| rows[i % len].code == 1)
        .unwrap_or(trigger_idx)
        % len;

    rows.rotate_left(rotate_at);
    Ok(rows)
}

/// Phase (b): track the timestamp MSB across the rotated sequence; once a
/// rise is followed by a fall (the counter wrapped), add `2^t` to that
/// sample and every sample after it.
fn time_unwrap(rows: &mut [RleRow], ts_bits: u8) {
    let msb = 1u64 << (ts_bits - 1);
    let wrap = 1u64 << ts_bits;

    let mut seen_rise = false;
    let mut wrapped = false;
    let mut prev_msb = false;

    for row in rows.iter_mut() {
        let cur_msb = row.time & msb != 0;
        if !wrapped {
            if prev_msb && !cur_msb && seen_rise {
                wrapped = true;
            } else if cur_msb {
                seen_rise = true;
            }
        }
        if wrapped {
            row.time += wrap;
        }
        prev_msb = cur_msb;
    }
}

/// Phase (c): walk outward from the trigger index, dropping the tail as
/// soon as monotonicity breaks. Returns the retained slice and cull count.
fn time_cull(rows: &[RleRow], trigger_idx: usize) -> (usize, usize, usize) {
    let trigger_time = rows[trigger_idx].time;

    let mut start = 0;
    let mut prev = trigger_time;
    for j in (0..trigger_idx).rev() {
        if rows[j].time < prev {
            prev = rows[j].time;
        } else {
            start = j + 1;
            break;
        }
    }

    let mut end = rows.len() - 1;
    let mut prev = trigger_time;
    for j in trigger_idx + 1..rows.len() {
        if rows[j].time > prev {
            prev = rows[j].time;
        } else {
            end = j - 1;
            break;
        }
    }

    let culled = rows.len() - (end - start + 1);
    (start, end, culled)
}

/// Run the full register-level download decode + post-processing pipeline.
pub fn decode(pages: &[Vec<u32>], depth: usize, params: &RleParams, hub: u8, pod: u8) -> SumpResult<Vec<RleSample>> {
    let rows = unpack_rows(pages, depth, params.ts_bits, params.data_bits);
    let mut rows = rotate(rows, hub, pod)?;

    time_unwrap(&mut rows, params.ts_bits);

    let trigger_idx = rows
        .iter()
        .position(|r| r.code == 2)
        .expect("rotate guarantees a trigger sample is present");

    let (start, end, culled) = time_cull(&rows, trigger_idx);
    if culled > 0 {
        warn!(hub, pod, culled, "RLE time-cull dropped non-monotonic samples");
    }

    let trigger_time = rows[trigger_idx].time as i64;
    let offset_ps = params.trigger_miso_latency_ps
        + params.pod_core_clock_ps * params.trigger_core_cycles
        + params.clock_ps * (params.trigger_mosi_cycles - 5);

    Ok(rows[start..=end]
        .iter()
        .map(|r| {
            let signed_ticks = r.time as i64 - trigger_time;
            RleSample {
                code: r.code,
                data: r.data,
                time_ps: signed_ticks * params.clock_ps + offset_ps,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RleParams {
        RleParams {
            ts_bits: 8,
            data_bits: 4,
            clock_ps: 10_000, // 10 ns/ck
            trigger_miso_latency_ps: 0,
            pod_core_clock_ps: 0,
            trigger_core_cycles: 0,
            trigger_mosi_cycles: 5, // (mosi - 5) term zeroed out
            bit_mask: 0,
        }
    }

    /// Scenario S2 setup: t=8, d=4, rows (code, time, data) =
    /// (1,0x05,0xA), (1,0xF0,0xB), (2,0x00,0xC), (3,0x10,0xD). Rotation
    /// keeps order (trigger's next "1" wraps back to index 0); the MSB
    /// rises at 0xF0 and falls at 0x00, so the fall sample and everything
    /// after it gains 0x100 before the trigger subtraction.
    fn s2_rows() -> Vec<RleRow> {
        vec![
            RleRow { code: 1, time: 0x05, data: 0xA },
            RleRow { code: 1, time: 0xF0, data: 0xB },
            RleRow { code: 2, time: 0x00, data: 0xC },
            RleRow { code: 3, time: 0x10, data: 0xD },
        ]
    }

    #[test]
    fn rotate_keeps_order_when_pretrig_wraps_to_start() {
        let rotated = rotate(s2_rows(), 0, 0).unwrap();
        assert_eq!(rotated, s2_rows());
    }

    #[test]
    fn time_unwrap_adds_wrap_constant_from_fall_sample_onward() {
        let mut rows = s2_rows();
        time_unwrap(&mut rows, 8);
        assert_eq!(rows[0].time, 0x05);
        assert_eq!(rows[1].time, 0xF0);
        assert_eq!(rows[2].time, 0x100);
        assert_eq!(rows[3].time, 0x110);
    }

    #[test]
    fn scenario_s2_yields_signed_ps_timestamps_around_zeroed_trigger() {
        let pages = Vec::<Vec<u32>>::new(); // unused; decode() below is driven directly
        let _ = pages;

        let mut rows = rotate(s2_rows(), 0, 0).unwrap();
        time_unwrap(&mut rows, 8);
        let trigger_idx = rows.iter().position(|r| r.code == 2).unwrap();
        let (start, end, culled) = time_cull(&rows, trigger_idx);
        assert_eq!(culled, 0);

        let p = params();
        let trigger_time = rows[trigger_idx].time as i64;
        let offset_ps =
            p.trigger_miso_latency_ps + p.pod_core_clock_ps * p.trigger_core_cycles + p.clock_ps * (p.trigger_mosi_cycles - 5);
        let samples: Vec<i64> = rows[start..=end]
            .iter()
            .map(|r| (r.time as i64 - trigger_time) * p.clock_ps + offset_ps)
            .collect();

        assert_eq!(samples, vec![-2_510_000, -160_000, 0, 160_000]);
    }

    /// P1: the trigger sample's signed time is exactly zero, and every
    /// sample's time is strictly increasing end to end, driven through the
    /// full `decode()` entry point (register pages in, samples out) rather
    /// than the row-level helpers the other tests exercise directly.
    #[test]
    fn p1_trigger_sample_is_time_zero_and_samples_are_monotonic() {
        fn pack(code: u8, time: u8, data: u8) -> u32 {
            (((code as u32) << 12) | ((time as u32) << 4) | data as u32) << 18
        }
        let pages = vec![vec![pack(1, 0x05, 0xA), pack(1, 0xF0, 0xB), pack(2, 0x00, 0xC), pack(3, 0x10, 0xD)]];

        let samples = decode(&pages, 4, &params(), 0, 0).unwrap();

        let trigger = samples.iter().find(|s| s.code == 2).expect("trigger sample present");
        assert_eq!(trigger.time_ps, 0);

        for pair in samples.windows(2) {
            assert!(pair[0].time_ps < pair[1].time_ps, "samples must be strictly increasing");
        }
    }

    #[test]
    fn no_trigger_marker_is_a_sample_decode_error() {
        let rows = vec![RleRow { code: 1, time: 0, data: 0 }, RleRow { code: 3, time: 1, data: 0 }];
        let err = rotate(rows, 2, 5).unwrap_err();
        match err {
            SumpError::SampleDecode { hub, pod, .. } => {
                assert_eq!(hub, 2);
                assert_eq!(pod, 5);
            }
            other => panic!("expected SampleDecode, got {other:?}"),
        }
    }

    /// B1: data-bits not a multiple of 4 — low `d` bits go to data
    /// regardless of hex-nibble boundaries; the rest is code+timestamp.
    #[test]
    fn b1_non_nibble_aligned_data_width_splits_on_bit_boundary() {
        // t=4, d=3: total_bits=9, one page (32 bits) of padding=23.
        // Packed value (in the low 9 bits after pad shift): code=2(0b10),
        // time=0b1010, data=0b101.
        let packed: u32 = 0b10_1010_101u32 << (32 - 9);
        let pages = vec![vec![packed]];
        let rows = unpack_rows(&pages, 1, 4, 3);
        assert_eq!(rows[0].code, 0b10);
        assert_eq!(rows[0].time, 0b1010);
        assert_eq!(rows[0].data, 0b101);
    }

    #[test]
    fn to_line_formats_code_time_data_as_hex() {
        let row = RleRow { code: 2, time: 0x00, data: 0xC };
        assert_eq!(row.to_line(8, 4), "2 00 c");
    }

    #[test]
    fn sample_to_line_masks_bits_with_x() {
        let sample = RleSample { code: 2, data: 0b1010, time_ps: 0 };
        // bit 1 masked: lsb-first "0 X 0 1"
        assert_eq!(sample.to_line(4, 0b0010), "0X01 2 0");
    }
}

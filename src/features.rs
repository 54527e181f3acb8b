//! Turns a flow's raw packet samples into a fixed-width feature window.

use crate::{FlowKey, PacketSample};

pub const ARRIVAL_TIME_FET: &str = "arrival time us";
pub const SEQ_FET: &str = "seq";
pub const WIRELEN_FET: &str = "wire len B";
pub const PAYLOAD_FET: &str = "payload B";
pub const RTT_ESTIMATE_FET: &str = "RTT estimate us-ewma-alpha0.01";
pub const INTERARRIVAL_FET: &str = "interarrival time us-ewma-alpha0.01";
pub const THR_ESTIMATE_FET: &str = "throughput B/s-ewma-alpha0.007";
pub const MIN_RTT_FET: &str = "min RTT us";
pub const LOSS_RATE_FET: &str = "loss rate-ewma-alpha0.01";
pub const MATHIS_MODEL_FET: &str = "mathis model label-ewma-alpha0.01";

/// Every feature the extractor can produce, in column order.
pub const ALL_FEATURES: [&str; 10] = [
    ARRIVAL_TIME_FET,
    SEQ_FET,
    WIRELEN_FET,
    PAYLOAD_FET,
    RTT_ESTIMATE_FET,
    INTERARRIVAL_FET,
    THR_ESTIMATE_FET,
    MIN_RTT_FET,
    LOSS_RATE_FET,
    MATHIS_MODEL_FET,
];

/// Marks a feature value that could not be computed for a row.
pub const UNKNOWN: f64 = -1.0;

/// `min_rtt_us` before any RTT has been observed.
pub const MIN_RTT_UNKNOWN: u32 = u32::MAX;

const RTT_ALPHA: f64 = 0.01;
const INTERARRIVAL_ALPHA: f64 = 0.01;
const THR_ALPHA: f64 = 0.007;
const LOSS_ALPHA: f64 = 0.01;
const MATHIS_ALPHA: f64 = 0.01;
const MATHIS_C: f64 = 1.224_744_871_391_589; // sqrt(3/2)

/// Rows of feature values whose columns follow `names`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl FeatureWindow {
    pub fn new(names: Vec<String>, rows: Vec<Vec<f64>>) -> Self {
        Self { names, rows }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.rows.iter().map(|row| row[idx]).collect())
    }

    /// Replace the unknown sentinel and any non-finite values before classification.
    ///
    /// Backends that handle missing values natively get NaN for unknowns,
    /// everything else gets 0.
    pub fn sanitize(&mut self, missing_as_nan: bool) {
        let missing = if missing_as_nan { f64::NAN } else { 0.0 };
        for value in self.rows.iter_mut().flatten() {
            if *value == UNKNOWN {
                *value = missing;
            } else if !value.is_finite() {
                *value = 0.0;
            }
        }
    }
}

/// Computes feature windows for one classifier input schema.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    schema: Vec<String>,
    columns: Vec<usize>,
    window: usize,
}

impl FeatureExtractor {
    /// Fails if the schema names a feature this extractor cannot compute.
    pub fn new(schema: &[String], window: usize) -> anyhow::Result<Self> {
        let columns = schema
            .iter()
            .map(|name| {
                ALL_FEATURES
                    .iter()
                    .position(|f| *f == name.as_str())
                    .ok_or_else(|| {
                        anyhow::anyhow!("Unknown feature in classifier schema: {:?}", name)
                    })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        anyhow::ensure!(window > 0, "Feature window must hold at least one row");
        Ok(Self {
            schema: schema.to_vec(),
            columns,
            window,
        })
    }

    /// Featurize `samples` for `flow`.
    ///
    /// Returns the most recent `window` rows and the flow's updated minimum RTT,
    /// which never exceeds `min_rtt_us`.
    pub fn extract(
        &self,
        flow: &FlowKey,
        samples: &[PacketSample],
        min_rtt_us: u32,
    ) -> (FeatureWindow, u32) {
        let sorted = sort_by_arrival(samples);
        let (full, min_rtt_us) = compute_rows(&sorted, min_rtt_us);

        let skip = full.len().saturating_sub(self.window);
        let rows = full[skip..]
            .iter()
            .map(|row| self.columns.iter().map(|&c| row[c]).collect())
            .collect::<Vec<Vec<f64>>>();

        tracing::trace!(
            "Flow {}: featurized {} packets into {} rows, min RTT {} us",
            flow,
            samples.len(),
            rows.len(),
            min_rtt_us
        );
        (FeatureWindow::new(self.schema.clone(), rows), min_rtt_us)
    }
}

/// Samples ordered by arrival time, ties broken by sequence number.
pub fn sort_by_arrival(samples: &[PacketSample]) -> Vec<PacketSample> {
    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|s| (s.time_us, s.seq));
    sorted
}

/// Average receive rate across time-sorted samples, in bytes per second.
///
/// The first packet only marks the start of the interval.
pub fn window_throughput_bps(sorted: &[PacketSample]) -> Option<f64> {
    let (first, last) = (sorted.first()?, sorted.last()?);
    let span_us = last.time_us.checked_sub(first.time_us)?;
    if sorted.len() < 2 || span_us == 0 {
        return None;
    }
    let bytes: u64 = sorted[1..].iter().map(|s| u64::from(s.total_bytes)).sum();
    Some(bytes as f64 / (span_us as f64 / 1e6))
}

fn ewma(prev: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match prev {
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        None => sample,
    }
}

fn known(value: Option<f64>) -> f64 {
    value.unwrap_or(UNKNOWN)
}

/// One row per sample with every column in `ALL_FEATURES`.
fn compute_rows(sorted: &[PacketSample], mut min_rtt_us: u32) -> (Vec<[f64; 10]>, u32) {
    let mut rows = Vec::with_capacity(sorted.len());

    let mut rtt_ewma = None;
    let mut interarrival_ewma = None;
    let mut thr_ewma = None;
    let mut loss_ewma = None;
    let mut mathis_ewma = None;
    let mut highest_seq_end: Option<u32> = None;
    let mut mss: u32 = 0;
    let mut prev_time_us: Option<u64> = None;

    for pkt in sorted {
        if let Some(rtt) = pkt.rtt() {
            min_rtt_us = min_rtt_us.min(rtt);
            rtt_ewma = Some(ewma(rtt_ewma, f64::from(rtt), RTT_ALPHA));
        }
        mss = mss.max(pkt.payload_bytes);

        let mut loss_known = false;
        if let Some(prev) = prev_time_us {
            let delta_us = pkt.time_us - prev;
            interarrival_ewma = Some(ewma(
                interarrival_ewma,
                delta_us as f64,
                INTERARRIVAL_ALPHA,
            ));
            if delta_us > 0 {
                let rate = f64::from(pkt.total_bytes) / (delta_us as f64 / 1e6);
                thr_ewma = Some(ewma(thr_ewma, rate, THR_ALPHA));
            }
            // A segment starting below data already received is a retransmission.
            let retransmit = highest_seq_end.is_some_and(|end| seq_before(pkt.seq, end));
            loss_ewma = Some(ewma(loss_ewma, f64::from(u8::from(retransmit)), LOSS_ALPHA));
            loss_known = true;
        }
        let seq_end = pkt.seq.wrapping_add(pkt.payload_bytes);
        highest_seq_end = Some(match highest_seq_end {
            Some(end) if seq_before(seq_end, end) => end,
            _ => seq_end,
        });
        prev_time_us = Some(pkt.time_us);

        let mathis_label = match (thr_ewma, rtt_ewma, loss_ewma) {
            (Some(thr), Some(rtt_us), Some(loss)) if loss > 0.0 && rtt_us > 0.0 && mss > 0 => {
                let fair_bps = f64::from(mss) / (rtt_us / 1e6) * (MATHIS_C / loss.sqrt());
                Some(f64::from(u8::from(thr > fair_bps)))
            }
            _ => None,
        };
        if let Some(label) = mathis_label {
            mathis_ewma = Some(ewma(mathis_ewma, label, MATHIS_ALPHA));
        }

        let min_rtt = (min_rtt_us != MIN_RTT_UNKNOWN).then_some(f64::from(min_rtt_us));
        rows.push([
            pkt.time_us as f64,
            f64::from(pkt.seq),
            f64::from(pkt.total_bytes),
            f64::from(pkt.payload_bytes),
            known(rtt_ewma),
            known(interarrival_ewma),
            known(thr_ewma),
            known(min_rtt),
            if loss_known { known(loss_ewma) } else { UNKNOWN },
            if mathis_label.is_some() {
                known(mathis_ewma)
            } else {
                UNKNOWN
            },
        ]);
    }
    (rows, min_rtt_us)
}

/// Sequence-space comparison that tolerates wraparound.
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pkt(seq: u32, time_us: u64, rtt_us: u32) -> PacketSample {
        PacketSample {
            seq,
            rtt_us,
            total_bytes: 1500,
            ihl_bytes: 20,
            thl_bytes: 32,
            payload_bytes: 1448,
            time_us,
            ..Default::default()
        }
    }

    fn flow() -> FlowKey {
        FlowKey::new(1, 2, 3, 4)
    }

    fn run(samples: usize) -> Vec<PacketSample> {
        (0..samples as u32)
            .map(|i| pkt(i * 1448, 1_000 + u64::from(i) * 100, 2_000 + (i % 3) * 500))
            .collect()
    }

    #[test]
    fn rejects_unknown_schema_names() {
        assert!(FeatureExtractor::new(&schema(&["bogus"]), 10).is_err());
        assert!(FeatureExtractor::new(&schema(&[SEQ_FET]), 0).is_err());
        assert!(FeatureExtractor::new(&schema(&ALL_FEATURES), 10).is_ok());
    }

    #[test]
    fn keeps_only_the_trailing_window() {
        let ex = FeatureExtractor::new(&schema(&[SEQ_FET, ARRIVAL_TIME_FET]), 10).unwrap();
        let (fets, _) = ex.extract(&flow(), &run(25), MIN_RTT_UNKNOWN);
        assert_eq!(fets.len(), 10);
        assert_eq!(fets.rows()[0], vec![f64::from(15 * 1448), 2_500.0]);
        assert_eq!(fets.rows()[9], vec![f64::from(24 * 1448), 3_400.0]);
    }

    #[test]
    fn min_rtt_never_increases() {
        let ex = FeatureExtractor::new(&schema(&[MIN_RTT_FET]), 10).unwrap();
        let (_, min_rtt) = ex.extract(&flow(), &run(6), MIN_RTT_UNKNOWN);
        assert_eq!(min_rtt, 2_000);
        let (_, min_rtt) = ex.extract(&flow(), &run(6), 1_500);
        assert_eq!(min_rtt, 1_500);
        let none = [pkt(0, 10, 0), pkt(1448, 20, 0)];
        let (fets, min_rtt) = ex.extract(&flow(), &none, MIN_RTT_UNKNOWN);
        assert_eq!(min_rtt, MIN_RTT_UNKNOWN);
        assert_eq!(fets.column(MIN_RTT_FET).unwrap(), vec![UNKNOWN, UNKNOWN]);
    }

    #[test]
    fn first_row_has_unknown_deltas() {
        let names = schema(&[INTERARRIVAL_FET, THR_ESTIMATE_FET, LOSS_RATE_FET]);
        let ex = FeatureExtractor::new(&names, 10).unwrap();
        let (fets, _) = ex.extract(&flow(), &run(3), MIN_RTT_UNKNOWN);
        assert_eq!(fets.rows()[0], vec![UNKNOWN, UNKNOWN, UNKNOWN]);
        assert_eq!(fets.rows()[1][0], 100.0);
        assert_eq!(fets.rows()[1][1], 1500.0 / 100e-6);
        assert_eq!(fets.rows()[1][2], 0.0);
    }

    #[test]
    fn out_of_order_input_matches_sorted_input() {
        let ex = FeatureExtractor::new(&schema(&ALL_FEATURES), 10).unwrap();
        let sorted = run(14);
        let mut shuffled = sorted.clone();
        shuffled.reverse();
        shuffled.swap(0, 7);
        shuffled.swap(3, 11);
        assert_eq!(
            ex.extract(&flow(), &sorted, MIN_RTT_UNKNOWN),
            ex.extract(&flow(), &shuffled, MIN_RTT_UNKNOWN)
        );
    }

    #[test]
    fn retransmissions_drive_loss_and_mathis_label() {
        let ex = FeatureExtractor::new(&schema(&[LOSS_RATE_FET, MATHIS_MODEL_FET]), 10).unwrap();
        let mut samples = run(4);
        // Resend the second segment.
        samples.push(pkt(1448, 1_400, 2_000));
        let (fets, _) = ex.extract(&flow(), &samples, MIN_RTT_UNKNOWN);
        let last = fets.rows().last().unwrap();
        assert!(last[0] > 0.0);
        assert!(last[1] == 0.0 || last[1] == 1.0);
        assert_eq!(fets.rows()[1][1], UNKNOWN);
    }

    #[test]
    fn sanitize_replaces_unknowns() {
        let mut w = FeatureWindow::new(
            schema(&[SEQ_FET, RTT_ESTIMATE_FET]),
            vec![vec![UNKNOWN, f64::INFINITY]],
        );
        let mut nan = w.clone();
        w.sanitize(false);
        assert_eq!(w.rows()[0], vec![0.0, 0.0]);
        nan.sanitize(true);
        assert!(nan.rows()[0][0].is_nan());
        assert_eq!(nan.rows()[0][1], 0.0);
    }

    #[test]
    fn throughput_needs_a_time_span() {
        assert_eq!(window_throughput_bps(&[]), None);
        assert_eq!(window_throughput_bps(&[pkt(0, 5, 0)]), None);
        assert_eq!(window_throughput_bps(&[pkt(0, 5, 0), pkt(1, 5, 0)]), None);
        let tput = window_throughput_bps(&[pkt(0, 0, 0), pkt(1, 500_000, 0), pkt(2, 1_000_000, 0)]);
        assert_eq!(tput, Some(3000.0));
    }
}

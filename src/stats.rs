//! 전송 통계

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// 플로우 하나의 전송 통계
#[derive(Debug, Clone, Default)]
pub struct FlowStats {
    /// 보낸 세그먼트 요청 수 (재전송 포함)
    pub segments_sent: u64,

    /// 수신한 세그먼트 수
    pub segments_received: u64,

    /// 재전송 수
    pub retransmitted: u64,

    /// 재전송 큐에 있었지만 먼저 도착해 생략된 수
    pub skipped_retx: u64,

    /// 타임아웃 수
    pub timeouts: u64,

    /// 혼잡 마크 수신 수
    pub cong_marks: u64,

    /// 혼잡 마크로 인한 윈도우 감소 수
    pub mark_decreases: u64,

    /// 손실로 인한 윈도우 감소 수
    pub loss_decreases: u64,

    /// 완료한 청크 수
    pub chunks_completed: u64,

    /// 수신 바이트
    pub bytes_received: u64,

    /// RTT 통계
    pub rtt_min: Option<Duration>,
    pub rtt_avg: Option<Duration>,
    pub rtt_max: Option<Duration>,
}

impl FlowStats {
    /// 재전송 비율 (%)
    pub fn retransmission_ratio(&self) -> f64 {
        if self.segments_sent == 0 {
            return 0.0;
        }
        self.retransmitted as f64 * 100.0 / self.segments_sent as f64
    }

    /// 한 줄 요약
    pub fn summary(&self) -> String {
        let rtt = match (self.rtt_min, self.rtt_avg, self.rtt_max) {
            (Some(min), Some(avg), Some(max)) => format!(
                "{:.3}/{:.3}/{:.3} ms",
                min.as_secs_f64() * 1000.0,
                avg.as_secs_f64() * 1000.0,
                max.as_secs_f64() * 1000.0
            ),
            _ => "stats unavailable".to_string(),
        };

        format!(
            "Chunks: {} | Segments: {}/{} sent (retx {} {:.1}%, skipped {}) | Timeouts: {} | CongMarks: {} (decr {}) | LossDecr: {} | Bytes: {} | RTT min/avg/max = {}",
            self.chunks_completed,
            self.segments_received,
            self.segments_sent,
            self.retransmitted,
            self.retransmission_ratio(),
            self.skipped_retx,
            self.timeouts,
            self.cong_marks,
            self.mark_decreases,
            self.loss_decreases,
            self.bytes_received,
            rtt,
        )
    }
}

/// 플로우별 통계 레지스트리
///
/// 여러 태스크가 동시에 갱신하므로 DashMap으로 보관
#[derive(Debug)]
pub struct StatsRegistry {
    flows: DashMap<String, FlowStats>,
    start_time: Instant,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// 시작 후 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 플로우 통계 갱신
    pub fn record<F>(&self, flow: &str, update: F)
    where
        F: FnOnce(&mut FlowStats),
    {
        let mut entry = self.flows.entry(flow.to_string()).or_default();
        update(&mut entry);
    }

    /// 플로우 통계 복사본
    pub fn get(&self, flow: &str) -> Option<FlowStats> {
        self.flows.get(flow).map(|s| s.clone())
    }

    /// 플로우 수
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// 전 플로우 합산 요약
    pub fn summary(&self) -> String {
        let mut total = FlowStats::default();
        for entry in self.flows.iter() {
            let s = entry.value();
            total.segments_sent += s.segments_sent;
            total.segments_received += s.segments_received;
            total.retransmitted += s.retransmitted;
            total.skipped_retx += s.skipped_retx;
            total.timeouts += s.timeouts;
            total.cong_marks += s.cong_marks;
            total.mark_decreases += s.mark_decreases;
            total.loss_decreases += s.loss_decreases;
            total.chunks_completed += s.chunks_completed;
            total.bytes_received += s.bytes_received;
        }

        let elapsed = self.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            total.bytes_received as f64 * 8.0 / elapsed
        } else {
            0.0
        };

        format!(
            "Elapsed: {:.2}s | Flows: {} | Goodput: {} | {}",
            elapsed,
            self.flows.len(),
            format_throughput(throughput),
            total.summary(),
        )
    }

    /// 플로우별 요약 줄 목록 (이름 순)
    pub fn per_flow_summaries(&self) -> Vec<String> {
        let mut lines: Vec<(String, String)> = self
            .flows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().summary()))
            .collect();
        lines.sort();
        lines
            .into_iter()
            .map(|(flow, summary)| format!("[{flow}] {summary}"))
            .collect()
    }
}

/// bit/s 단위 처리량 포매팅
pub fn format_throughput(mut throughput: f64) -> String {
    let units = ["bit/s", "kbit/s", "Mbit/s", "Gbit/s", "Tbit/s"];
    let mut unit = 0;
    while throughput >= 1000.0 && unit < units.len() - 1 {
        throughput /= 1000.0;
        unit += 1;
    }
    format!("{:.3} {}", throughput, units[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_summary() {
        let registry = StatsRegistry::new();
        registry.record("agg1", |s| {
            s.segments_sent = 100;
            s.segments_received = 98;
            s.retransmitted = 2;
            s.bytes_received = 98_000;
        });
        registry.record("agg2", |s| {
            s.segments_sent = 50;
        });

        assert_eq!(registry.flow_count(), 2);
        let stats = registry.get("agg1").unwrap();
        assert_eq!(stats.retransmission_ratio(), 2.0);

        let lines = registry.per_flow_summaries();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[agg1]"));

        let summary = registry.summary();
        assert!(summary.contains("Flows: 2"));
    }

    #[test]
    fn test_format_throughput() {
        assert_eq!(format_throughput(500.0), "500.000 bit/s");
        assert_eq!(format_throughput(1_500.0), "1.500 kbit/s");
        assert_eq!(format_throughput(2_000_000.0), "2.000 Mbit/s");
        assert_eq!(format_throughput(3_000_000_000.0), "3.000 Gbit/s");
    }
}

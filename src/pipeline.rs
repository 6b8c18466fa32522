//! 세그먼트 파이프라인
//!
//! 버전 이름 하나(청크 하나)의 전체 세그먼트를 적응형 윈도우로 수집한다.
//! RTO 만료 스캔과 재전송 FIFO를 소유하고, 윈도우 감소는 복구 지점으로
//! RTT당 한 번으로 제한한다(conservative window adaptation).
//! 같은 플로우의 연속 파이프라인들은 FlowState(윈도우/RTT)를 공유한다

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cc::{self, CongestionControl, Window};
use crate::config::Config;
use crate::controller::{ChunkPayload, FlowController};
use crate::error::{Error, Result};
use crate::face::{Face, FaceReply};
use crate::name::Name;
use crate::packet::{Data, Interest, Nack, NackReason};
use crate::rtt::RttEstimator;
use crate::stats::{self, StatsRegistry};

/// 플로우 하나가 청크들을 가로질러 유지하는 상태
///
/// 앞 청크의 꼬리 재전송과 다음 청크의 시작이 겹치므로, 같은 플로우의
/// 파이프라인들이 하나의 윈도우/in-flight/RTT 추정기를 공유한다
pub struct FlowState {
    inner: Mutex<FlowStateInner>,
}

struct FlowStateInner {
    window: Window,
    in_flight: i64,
    rtt: RttEstimator,
    cc: Box<dyn CongestionControl>,
}

impl FlowState {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FlowStateInner {
                window: Window::new(config.init_cwnd, config.init_ssthresh),
                in_flight: 0,
                rtt: RttEstimator::new(config.rtt.clone()),
                cc: cc::make_algorithm(config),
            }),
        })
    }

    pub fn cwnd(&self) -> f64 {
        self.inner.lock().window.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.inner.lock().window.ssthresh
    }

    pub fn in_flight(&self) -> i64 {
        self.inner.lock().in_flight
    }

    /// 윈도우 여유분 (cwnd - in-flight)
    pub fn available_window(&self) -> f64 {
        let inner = self.inner.lock();
        inner.window.cwnd - inner.in_flight as f64
    }

    fn in_flight_increment(&self) {
        self.inner.lock().in_flight += 1;
    }

    fn in_flight_decrement(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.in_flight > 0, "플로우 in-flight 카운터 음수 진입");
        inner.in_flight -= 1;
    }

    fn estimated_rto(&self) -> Duration {
        self.inner.lock().rtt.estimated_rto()
    }

    fn increase_window(&self) {
        let inner = &mut *self.inner.lock();
        inner.cc.increase_window(&mut inner.window, &inner.rtt);
    }

    fn decrease_window(&self) {
        let inner = &mut *self.inner.lock();
        inner.cc.decrease_window(&mut inner.window, &inner.rtt);
    }

    fn backoff_rto(&self) {
        self.inner.lock().rtt.backoff_rto();
    }

    fn add_rtt_measurement(&self, rtt: Duration, n_expected_samples: usize) {
        let inner = &mut *self.inner.lock();
        inner.rtt.add_measurement(rtt, n_expected_samples);
        inner
            .cc
            .after_rtt_measurement(rtt.as_secs_f64(), &mut inner.window, &inner.rtt);
    }

    /// RTT min/avg/max 스냅샷
    pub fn rtt_stats(&self) -> (Option<Duration>, Option<Duration>, Option<Duration>) {
        let inner = self.inner.lock();
        (
            inner.rtt.min_rtt(),
            inner.rtt.avg_rtt(),
            inner.rtt.max_rtt(),
        )
    }
}

/// in-flight 세그먼트의 생애 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    /// 처음 전송됨
    FirstTimeSent,

    /// 재전송 큐에 들어 있음
    InRetxQueue,

    /// 재전송됨
    Retransmitted,
}

/// in-flight 세그먼트 항목
#[derive(Debug)]
struct SegmentInfo {
    time_sent: Instant,
    rto: Duration,
    state: SegmentState,
}

/// 전송 태스크가 돌려주는 세그먼트 하나의 결과
#[derive(Debug)]
enum SegmentOutcome {
    Data(Data),
    Nack(Nack),
    Timeout,
    Error(String),
}

/// 세그먼트 파이프라인
pub struct SegmentPipeline {
    face: Face,
    prefix: Name,
    flow: String,
    config: Arc<Config>,
    state: Arc<FlowState>,
    controller: Arc<FlowController>,
    stats: Arc<StatsRegistry>,

    event_tx: mpsc::Sender<(u64, SegmentOutcome)>,
    event_rx: Option<mpsc::Receiver<(u64, SegmentOutcome)>>,

    segment_info: HashMap<u64, SegmentInfo>,
    retx_queue: VecDeque<u64>,
    retx_count: HashMap<u64, u32>,
    received: ChunkPayload,

    next_segment: u64,
    high_data: u64,
    high_interest: u64,
    recovery_point: u64,
    n_in_flight: i64,

    n_sent: u64,
    n_received: u64,
    n_retransmitted: u64,
    n_skipped_retx: u64,
    n_timeouts: u64,
    n_cong_marks: u64,
    n_mark_decr: u64,
    n_loss_decr: u64,
    received_size: u64,

    has_final_block: bool,
    last_segment: u64,
    pending_failure: Option<(u64, String)>,
    failed: Option<Error>,
    proceed_tx: Option<oneshot::Sender<()>>,
    start_time: Instant,
}

impl SegmentPipeline {
    pub fn new(
        face: Face,
        versioned_name: Name,
        config: Arc<Config>,
        state: Arc<FlowState>,
        controller: Arc<FlowController>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        let flow = versioned_name.flow_id().unwrap_or_default().to_string();
        let (event_tx, event_rx) = mpsc::channel(1024);

        Self {
            face,
            prefix: versioned_name,
            flow,
            config,
            state,
            controller,
            stats,
            event_tx,
            event_rx: Some(event_rx),
            segment_info: HashMap::new(),
            retx_queue: VecDeque::new(),
            retx_count: HashMap::new(),
            received: ChunkPayload::new(),
            next_segment: 0,
            high_data: 0,
            high_interest: 0,
            recovery_point: 0,
            n_in_flight: 0,
            n_sent: 0,
            n_received: 0,
            n_retransmitted: 0,
            n_skipped_retx: 0,
            n_timeouts: 0,
            n_cong_marks: 0,
            n_mark_decr: 0,
            n_loss_decr: 0,
            received_size: 0,
            has_final_block: false,
            last_segment: 0,
            pending_failure: None,
            failed: None,
            proceed_tx: None,
            start_time: Instant::now(),
        }
    }

    /// 청크의 전체 세그먼트를 수집
    ///
    /// `proceed_tx`는 미전송 작업이 더 없어진 시점(혹은 완료 시점)에
    /// 한 번 신호된다. 호출자는 이 신호 후 다음 청크로 진행할 수 있다.
    /// 취소는 반환 future 드롭으로 충분하며, 이후의 응답 콜백은 무시된다
    pub async fn run(mut self, proceed_tx: oneshot::Sender<()>) -> Result<ChunkPayload> {
        self.proceed_tx = Some(proceed_tx);
        self.start_time = Instant::now();

        let mut event_rx = self
            .event_rx
            .take()
            .ok_or_else(|| Error::Unknown("파이프라인은 한 번만 실행 가능".into()))?;
        let controller = self.controller.clone();

        debug!("파이프라인 시작: {}", self.prefix);
        self.schedule_sends();

        let mut rto_timer = tokio::time::interval(self.config.rto_check_interval);
        rto_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if let Some(err) = self.failed.take() {
                error!("청크 수집 실패: {} ({})", self.prefix, err);
                self.record_stats(false);
                return Err(err);
            }
            if self.all_segments_received() {
                break;
            }
            self.maybe_signal_proceed();

            tokio::select! {
                _ = rto_timer.tick() => self.check_rto(),
                Some((seg_no, outcome)) = event_rx.recv() => self.handle_event(seg_no, outcome),
                _ = controller.unpaused() => {}
            }

            self.schedule_sends();
        }

        self.maybe_signal_proceed();
        self.record_stats(true);
        if !self.config.quiet {
            self.print_summary();
        }
        Ok(std::mem::take(&mut self.received))
    }

    /// 모든 세그먼트 수신 완료 여부
    fn all_segments_received(&self) -> bool {
        self.n_received > 0 && self.has_final_block && self.n_received - 1 >= self.last_segment
    }

    /// 미전송 작업이 더 없으면 진행 신호를 한 번 발행
    fn maybe_signal_proceed(&mut self) {
        if self.has_final_block && self.next_segment > self.last_segment {
            if let Some(tx) = self.proceed_tx.take() {
                let _ = tx.send(());
                debug!("진행 신호 발행: {}", self.prefix);
            }
        }
    }

    /// 윈도우 여유만큼 재전송 큐 우선으로 전송
    fn schedule_sends(&mut self) {
        if self.failed.is_some() {
            return;
        }
        // 플로우가 pacing으로 멈춰 있으면 재개 통지까지 전송 보류
        if self.controller.should_pause_flow(&self.flow) {
            return;
        }

        while self.state.available_window() > 0.0 {
            if let Some(retx_seg) = self.retx_queue.pop_front() {
                // 큐 대기 중 먼저 도착한 세그먼트는 생략
                if !self.segment_info.contains_key(&retx_seg) {
                    self.n_skipped_retx += 1;
                    continue;
                }
                self.send_segment(retx_seg, true);
            } else {
                if self.pending_failure.is_some() {
                    break;
                }
                if self.has_final_block && self.next_segment > self.last_segment {
                    break;
                }
                let seg_no = self.next_segment;
                self.next_segment += 1;
                self.send_segment(seg_no, false);
            }
            if self.failed.is_some() {
                break;
            }
        }
    }

    fn send_segment(&mut self, seg_no: u64, is_retransmission: bool) {
        if self.has_final_block && seg_no > self.last_segment {
            return;
        }

        if is_retransmission {
            let count = self.retx_count.entry(seg_no).or_insert(0);
            *count += 1;
            let max_retries = self.config.max_retries_on_timeout_or_nack;
            if max_retries != crate::fetcher::MAX_RETRIES_INFINITE
                && *count as i64 > max_retries as i64
            {
                return self.handle_fail(
                    seg_no,
                    format!("세그먼트 #{seg_no} 재시도 한도({max_retries}) 도달"),
                );
            }
            debug!("세그먼트 #{} 재전송 ({}회째): {}", seg_no, count, self.prefix);
        }

        let interest = Interest::new(self.prefix.clone().append_segment(seg_no))
            .with_must_be_fresh(self.config.must_be_fresh)
            .with_lifetime(self.config.interest_lifetime);

        self.segment_info.insert(
            seg_no,
            SegmentInfo {
                time_sent: Instant::now(),
                rto: self.state.estimated_rto(),
                state: if is_retransmission {
                    SegmentState::Retransmitted
                } else {
                    SegmentState::FirstTimeSent
                },
            },
        );

        self.state.in_flight_increment();
        self.n_in_flight += 1;
        self.n_sent += 1;
        if is_retransmission {
            self.n_retransmitted += 1;
        } else {
            self.high_interest = self.high_interest.max(seg_no);
        }

        let face = self.face.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let outcome = match face.express(&interest).await {
                Ok(FaceReply::Data(data)) => SegmentOutcome::Data(data),
                Ok(FaceReply::Nack(nack)) => SegmentOutcome::Nack(nack),
                Ok(FaceReply::Timeout) => SegmentOutcome::Timeout,
                Err(e) => SegmentOutcome::Error(e.to_string()),
            };
            // 파이프라인이 끝나 채널이 닫혀 있으면 조용히 무시
            let _ = event_tx.send((seg_no, outcome)).await;
        });
    }

    fn handle_event(&mut self, seg_no: u64, outcome: SegmentOutcome) {
        match outcome {
            SegmentOutcome::Data(data) => self.handle_data(seg_no, data),
            SegmentOutcome::Nack(nack) => self.handle_nack(seg_no, nack),
            SegmentOutcome::Timeout => self.handle_timeout(seg_no),
            SegmentOutcome::Error(reason) => self.handle_fail(seg_no, reason),
        }
    }

    fn handle_data(&mut self, seg_no: u64, data: Data) {
        // 서명 검증의 대역인 다이제스트 확인; 실패는 재시도 없이 종결
        if !data.verify_digest() {
            warn!("세그먼트 #{} 다이제스트 불일치: {}", seg_no, data.name);
            return self.terminal_failure(Error::Validation { name: data.name });
        }

        self.controller.add_received_bytes(data.content.len());

        if !self.has_final_block {
            if let Some(final_block) = data.final_block_id {
                self.last_segment = final_block;
                self.has_final_block = true;
                debug!("최종 세그먼트 번호 확인: {} ({})", final_block, self.prefix);
                self.cancel_in_flight_beyond(final_block);

                if let Some((failed_seg, reason)) = self.pending_failure.take() {
                    if failed_seg <= final_block {
                        // 실패한 세그먼트가 콘텐츠 범위 안으로 판명
                        return self.terminal_failure(Error::SegmentFailure {
                            name: self.prefix.clone().append_segment(failed_seg),
                            reason,
                        });
                    }
                }
            }
        }

        let Some(info) = self.segment_info.get(&seg_no) else {
            // 이미 수신했거나 취소된 세그먼트
            return;
        };
        let rtt_sample = info.time_sent.elapsed();
        let prev_state = info.state;

        self.high_data = self.high_data.max(seg_no);

        // 재전송 큐의 세그먼트는 타임아웃 시점에 이미 감소됨
        if prev_state != SegmentState::InRetxQueue {
            self.decrement_in_flight();
        }

        if data.congestion_mark > 0 {
            self.n_cong_marks += 1;
            if !self.config.ignore_cong_marks {
                if self.config.disable_cwa || self.high_data > self.recovery_point {
                    // RTT당 한 번만 감소
                    self.recovery_point = self.high_interest;
                    self.n_mark_decr += 1;
                    self.state.decrease_window();
                    debug!(
                        "혼잡 마크 수신 (value={}), cwnd={:.2}",
                        data.congestion_mark,
                        self.state.cwnd()
                    );
                }
            } else {
                self.state.increase_window();
            }
        } else {
            self.state.increase_window();
        }

        // 재전송 이력이 없는 세그먼트만 RTT 샘플링
        if (prev_state == SegmentState::FirstTimeSent || prev_state == SegmentState::InRetxQueue)
            && !self.retx_count.contains_key(&seg_no)
        {
            let n_expected = ((self.n_in_flight + 1) / 2).max(1) as usize;
            self.state.add_rtt_measurement(rtt_sample, n_expected);
        }

        self.segment_info.remove(&seg_no);
        self.received_size += data.content.len() as u64;
        self.received.insert(seg_no, data);
        self.n_received += 1;
    }

    fn handle_nack(&mut self, seg_no: u64, nack: Nack) {
        let Some(info) = self.segment_info.get(&seg_no) else {
            return;
        };
        let in_retx_queue = info.state == SegmentState::InRetxQueue;

        debug!(
            "세그먼트 #{} Nack 수신 (reason={}): {}",
            seg_no, nack.reason, self.prefix
        );

        match nack.reason {
            NackReason::Duplicate => {
                // 중복은 무시
            }
            NackReason::Congestion => {
                // RTO 스캔이 먼저 큐에 넣었으면 중복 처리하지 않음
                if !in_retx_queue {
                    self.enqueue_for_retransmission(seg_no);
                    self.record_timeout(seg_no);
                }
            }
            reason => {
                self.handle_fail(seg_no, format!("Nack reason={reason}"));
            }
        }
    }

    fn handle_timeout(&mut self, seg_no: u64) {
        let Some(info) = self.segment_info.get(&seg_no) else {
            return;
        };
        if info.state == SegmentState::InRetxQueue {
            return;
        }

        self.n_timeouts += 1;
        self.enqueue_for_retransmission(seg_no);
        self.record_timeout(seg_no);
    }

    /// 만료된 RTO 스캔: 기한 지난 in-flight 세그먼트를 재전송 큐로
    fn check_rto(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .segment_info
            .iter()
            .filter(|(_, info)| {
                info.state != SegmentState::InRetxQueue
                    && now.duration_since(info.time_sent) > info.rto
            })
            .map(|(&seg_no, _)| seg_no)
            .collect();

        if expired.is_empty() {
            return;
        }

        let mut high_timeout_seg = 0;
        for seg_no in expired {
            self.n_timeouts += 1;
            high_timeout_seg = high_timeout_seg.max(seg_no);
            debug!("세그먼트 #{} RTO 만료: {}", seg_no, self.prefix);
            self.enqueue_for_retransmission(seg_no);
        }
        self.record_timeout(high_timeout_seg);
    }

    /// 손실 이벤트: CWA 복구 지점을 지난 경우에만 윈도우 감소 + RTO 백오프
    fn record_timeout(&mut self, seg_no: u64) {
        if self.config.disable_cwa || seg_no > self.recovery_point {
            self.recovery_point = self.high_interest;
            self.state.decrease_window();
            self.state.backoff_rto();
            self.n_loss_decr += 1;
            debug!(
                "손실 이벤트, cwnd={:.2} ssthresh={:.2}",
                self.state.cwnd(),
                self.state.ssthresh()
            );
        }
    }

    fn enqueue_for_retransmission(&mut self, seg_no: u64) {
        assert!(
            self.n_in_flight > 0,
            "in-flight 0에서 재전송 큐 진입: segment #{seg_no}"
        );
        self.decrement_in_flight();
        self.retx_queue.push_back(seg_no);
        if let Some(info) = self.segment_info.get_mut(&seg_no) {
            info.state = SegmentState::InRetxQueue;
        }
    }

    fn decrement_in_flight(&mut self) {
        self.state.in_flight_decrement();
        self.n_in_flight -= 1;
        assert!(self.n_in_flight >= 0, "파이프라인 in-flight 카운터 음수");
    }

    fn handle_fail(&mut self, seg_no: u64, reason: String) {
        warn!("세그먼트 #{} 수신 실패: {} ({})", seg_no, reason, self.prefix);

        // 콘텐츠에 확실히 포함된 세그먼트의 실패는 치명적
        if self.has_final_block && seg_no <= self.last_segment {
            return self.terminal_failure(Error::SegmentFailure {
                name: self.prefix.clone().append_segment(seg_no),
                reason,
            });
        }

        if !self.has_final_block {
            if let Some(info) = self.segment_info.remove(&seg_no) {
                if info.state != SegmentState::InRetxQueue {
                    self.decrement_in_flight();
                }
            }

            self.cancel_in_flight_beyond(seg_no);

            if self.segment_info.is_empty() {
                return self.terminal_failure(Error::SegmentFailure {
                    name: self.prefix.clone(),
                    reason: "최종 세그먼트 번호를 알기 전에 수신이 끊김".into(),
                });
            }

            self.pending_failure = Some((seg_no, reason));
        }
        // has_final_block && seg_no > last_segment: 범위 밖, 무시
    }

    /// 지정 번호보다 큰 in-flight 세그먼트 전부 취소
    fn cancel_in_flight_beyond(&mut self, seg_no: u64) {
        let beyond: Vec<u64> = self
            .segment_info
            .keys()
            .filter(|&&s| s > seg_no)
            .copied()
            .collect();

        for s in beyond {
            if let Some(info) = self.segment_info.remove(&s) {
                if info.state != SegmentState::InRetxQueue {
                    self.decrement_in_flight();
                }
            }
        }
    }

    fn terminal_failure(&mut self, err: Error) {
        if self.failed.is_none() {
            self.failed = Some(err);
        }
    }

    fn record_stats(&self, completed: bool) {
        let (rtt_min, rtt_avg, rtt_max) = self.state.rtt_stats();
        self.stats.record(&self.flow, |s| {
            s.segments_sent += self.n_sent;
            s.segments_received += self.n_received;
            s.retransmitted += self.n_retransmitted;
            s.skipped_retx += self.n_skipped_retx;
            s.timeouts += self.n_timeouts;
            s.cong_marks += self.n_cong_marks;
            s.mark_decreases += self.n_mark_decr;
            s.loss_decreases += self.n_loss_decr;
            s.bytes_received += self.received_size;
            if completed {
                s.chunks_completed += 1;
            }
            s.rtt_min = rtt_min;
            s.rtt_avg = rtt_avg;
            s.rtt_max = rtt_max;
        });
    }

    fn print_summary(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let goodput = if elapsed > 0.0 {
            self.received_size as f64 * 8.0 / elapsed
        } else {
            0.0
        };
        info!(
            "청크 완료: {} | 세그먼트 {} | {} bytes | {:.2}ms | goodput {}",
            self.prefix,
            self.n_received,
            self.received_size,
            elapsed * 1000.0,
            stats::format_throughput(goodput),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::FaceServer;
    use bytes::Bytes;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            interest_lifetime: Duration::from_millis(200),
            rto_check_interval: Duration::from_millis(5),
            max_retries_on_timeout_or_nack: 5,
            ..Config::default()
        })
    }

    fn harness(
        config: &Arc<Config>,
    ) -> (
        Face,
        FaceServer,
        Arc<FlowState>,
        Arc<FlowController>,
        Arc<StatsRegistry>,
    ) {
        let (face, server) = Face::channel(0, 64);
        let state = FlowState::new(config);
        let (controller, _rx) = FlowController::new(vec!["pro1".into()], config.table_size);
        let stats = Arc::new(StatsRegistry::new());
        (face, server, state, controller, stats)
    }

    fn segment_data(prefix: &Name, seg_no: u64, last: u64, payload: &[u8]) -> Data {
        Data::new(
            prefix.clone().append_segment(seg_no),
            Bytes::copy_from_slice(payload),
        )
        .with_final_block_id(last)
    }

    /// 세그먼트 요청에 고정 콘텐츠로 응답하는 생산자
    fn spawn_segment_producer(
        mut server: FaceServer,
        prefix: Name,
        segments: Vec<Vec<u8>>,
        congestion_mark_on: Option<u64>,
        drop_once_for: Option<u64>,
    ) {
        tokio::spawn(async move {
            let last = segments.len() as u64 - 1;
            let mut dropped = false;
            while let Some(req) = server.recv().await {
                let interest = match req.interest() {
                    Ok(i) => i,
                    Err(_) => continue,
                };
                let Some(seg_no) = interest.name.segment() else {
                    continue;
                };

                if seg_no > last {
                    req.reply_nack(Nack {
                        name: interest.name,
                        reason: NackReason::NoRoute,
                    });
                    continue;
                }
                if Some(seg_no) == drop_once_for && !dropped {
                    dropped = true;
                    continue; // 응답 없이 버림 → 타임아웃
                }

                let mut data = segment_data(&prefix, seg_no, last, &segments[seg_no as usize]);
                if Some(seg_no) == congestion_mark_on {
                    data = data.with_congestion_mark(1);
                }
                req.reply_data(data);
            }
        });
    }

    #[tokio::test]
    async fn test_retrieves_all_segments() {
        let config = test_config();
        let (face, server, state, controller, stats) = harness(&config);
        let prefix = Name::from_parts(["pro1", "0"]);

        let segments: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 10]).collect();
        spawn_segment_producer(server, prefix.clone(), segments.clone(), None, None);

        let pipeline = SegmentPipeline::new(
            face,
            prefix,
            config,
            state,
            controller.clone(),
            stats.clone(),
        );
        let (proceed_tx, proceed_rx) = oneshot::channel();
        let payload = pipeline.run(proceed_tx).await.unwrap();

        assert_eq!(payload.len(), 5);
        for (seg_no, data) in &payload {
            assert_eq!(data.content.as_ref(), &segments[*seg_no as usize][..]);
        }
        // 완료 시 진행 신호도 발행됨
        proceed_rx.await.unwrap();
        // 수신 바이트 집계
        assert_eq!(controller.take_received_bytes(), 50);
        assert_eq!(stats.get("pro1").unwrap().chunks_completed, 1);
    }

    #[tokio::test]
    async fn test_retransmission_counts_segment_once() {
        let config = test_config();
        let (face, server, state, controller, stats) = harness(&config);
        let prefix = Name::from_parts(["pro1", "0"]);

        let segments: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 8]).collect();
        // 세그먼트 2의 첫 요청을 버려 타임아웃/재전송 유도
        spawn_segment_producer(server, prefix.clone(), segments, None, Some(2));

        let pipeline =
            SegmentPipeline::new(face, prefix, config, state, controller, stats.clone());
        let (proceed_tx, _proceed_rx) = oneshot::channel();
        let payload = pipeline.run(proceed_tx).await.unwrap();

        // 재전송된 세그먼트도 정확히 한 번만 집계
        assert_eq!(payload.len(), 4);
        let flow_stats = stats.get("pro1").unwrap();
        assert_eq!(flow_stats.segments_received, 4);
        assert!(flow_stats.retransmitted >= 1);
        assert!(flow_stats.timeouts >= 1);
    }

    #[tokio::test]
    async fn test_congestion_mark_still_completes() {
        let config = test_config();
        let (face, server, state, controller, stats) = harness(&config);
        let prefix = Name::from_parts(["pro1", "0"]);

        let segments: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 8]).collect();
        spawn_segment_producer(server, prefix.clone(), segments, Some(1), None);

        let pipeline =
            SegmentPipeline::new(face, prefix, config, state, controller, stats.clone());
        let (proceed_tx, _proceed_rx) = oneshot::channel();
        let payload = pipeline.run(proceed_tx).await.unwrap();

        assert_eq!(payload.len(), 6);
        assert_eq!(stats.get("pro1").unwrap().cong_marks, 1);
    }

    #[tokio::test]
    async fn test_failed_segment_within_content_is_fatal() {
        let config = test_config();
        let (face, mut server, state, controller, stats) = harness(&config);
        let prefix = Name::from_parts(["pro1", "0"]);

        // 세그먼트 0은 정상 응답, 1은 NoRoute Nack
        let reply_prefix = prefix.clone();
        tokio::spawn(async move {
            while let Some(req) = server.recv().await {
                let interest = req.interest().unwrap();
                let Some(seg_no) = interest.name.segment() else {
                    continue;
                };
                if seg_no == 0 {
                    req.reply_data(segment_data(&reply_prefix, 0, 3, b"aa"));
                } else {
                    req.reply_nack(Nack {
                        name: interest.name,
                        reason: NackReason::NoRoute,
                    });
                }
            }
        });

        let pipeline = SegmentPipeline::new(face, prefix, config, state, controller, stats);
        let (proceed_tx, _proceed_rx) = oneshot::channel();
        let err = pipeline.run(proceed_tx).await.unwrap_err();
        assert!(matches!(err, Error::SegmentFailure { .. }));
    }

    #[tokio::test]
    async fn test_corrupted_digest_is_fatal() {
        let config = test_config();
        let (face, mut server, state, controller, stats) = harness(&config);
        let prefix = Name::from_parts(["pro1", "0"]);

        let reply_prefix = prefix.clone();
        tokio::spawn(async move {
            while let Some(req) = server.recv().await {
                let interest = req.interest().unwrap();
                let Some(seg_no) = interest.name.segment() else {
                    continue;
                };
                let mut data = segment_data(&reply_prefix, seg_no, 3, b"valid");
                data.content = Bytes::from_static(b"tampered");
                req.reply_data(data);
            }
        });

        let pipeline = SegmentPipeline::new(face, prefix, config, state, controller, stats);
        let (proceed_tx, _proceed_rx) = oneshot::channel();
        let err = pipeline.run(proceed_tx).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_window_state_persists_across_pipelines() {
        let config = test_config();
        let (face, server, state, controller, stats) = harness(&config);
        let prefix = Name::from_parts(["pro1", "0"]);

        let segments: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 8]).collect();
        spawn_segment_producer(server, prefix.clone(), segments, None, None);

        let before = state.cwnd();
        let pipeline = SegmentPipeline::new(
            face,
            prefix,
            config,
            state.clone(),
            controller,
            stats,
        );
        let (proceed_tx, _proceed_rx) = oneshot::channel();
        pipeline.run(proceed_tx).await.unwrap();

        // 손실 없는 수집 후 윈도우는 플로우 상태에 남아 커져 있음
        assert!(state.cwnd() > before);
        assert_eq!(state.in_flight(), 0);
    }
}

//! 플로우 컨트롤러
//!
//! 플로우별/청크 번호별 결과를 버퍼링했다가, 모든 플로우가 같은 번호를
//! 공급한 시점에 바이트 평균으로 병합해 출력 스트림으로 내보낸다.
//! 출력은 청크 번호 오름차순을 벗어나지 않는다.
//! 가장 느린 플로우보다 table_size 이상 앞서간 플로우는 pacing으로 멈춘다

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::packet::Data;

/// 청크 하나의 페이로드: 서브 세그먼트 번호 → 데이터 패킷
pub type ChunkPayload = BTreeMap<u64, Data>;

/// 병합 완료되어 방출되는 청크
#[derive(Debug, Clone)]
pub struct MergedChunk {
    pub chunk_no: u64,
    pub segments: ChunkPayload,
}

impl MergedChunk {
    /// 세그먼트 순서대로 콘텐츠를 이어붙임
    pub fn into_bytes(self) -> Bytes {
        let total: usize = self.segments.values().map(|d| d.content.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for data in self.segments.values() {
            buf.extend_from_slice(&data.content);
        }
        buf.freeze()
    }
}

/// 병합 청크 수신측
pub type ChunkReceiver = mpsc::UnboundedReceiver<MergedChunk>;

/// 교차 플로우 공유 상태
///
/// 플로우들은 face별 스레드에서 도착하므로 전부 단일 뮤텍스 아래 둔다.
/// 수신 바이트 카운터도 같은 뮤텍스를 공유
#[derive(Debug, Default)]
struct ChunkBuffer {
    /// 플로우별 수신 버퍼 [flow][chunk_no] -> payload
    node_buffers: HashMap<String, BTreeMap<u64, ChunkPayload>>,

    /// 청크 번호별 공급 플로우 수
    completion_count: BTreeMap<u64, usize>,

    /// 플로우별 최고 수신 청크 번호 (첫 수신 후에만 엔트리 존재)
    highest_chunk: HashMap<String, u64>,

    /// pacing으로 멈춰야 하는 플로우
    paused: HashMap<String, bool>,

    /// 다음에 방출할 청크 번호
    next_release: u64,

    /// 처리량 집계용 수신 바이트
    received_bytes: u64,
}

/// 플로우 컨트롤러
pub struct FlowController {
    flow_names: Vec<String>,
    table_size: u64,
    buffer: Mutex<ChunkBuffer>,
    output_tx: mpsc::UnboundedSender<MergedChunk>,
    unpause: Notify,
}

impl FlowController {
    /// 컨트롤러와 병합 청크 수신 채널 생성
    pub fn new(flow_names: Vec<String>, table_size: u64) -> (Arc<Self>, ChunkReceiver) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let mut buffer = ChunkBuffer::default();
        for flow in &flow_names {
            buffer.node_buffers.insert(flow.clone(), BTreeMap::new());
            buffer.paused.insert(flow.clone(), false);
        }

        info!(
            "FlowController 초기화: {}개 플로우, table_size={}",
            flow_names.len(),
            table_size
        );

        let controller = Arc::new(Self {
            flow_names,
            table_size,
            buffer: Mutex::new(buffer),
            output_tx,
            unpause: Notify::new(),
        });
        (controller, output_rx)
    }

    /// 감시 중인 플로우 수
    pub fn flow_count(&self) -> usize {
        self.flow_names.len()
    }

    /// 감시 중인 플로우 이름들
    pub fn flow_names(&self) -> &[String] {
        &self.flow_names
    }

    /// 플로우의 청크 결과 추가
    ///
    /// 미지의 플로우, 빈 페이로드, 이미 기록된 (플로우, 청크) 쌍은 무시.
    /// 모든 플로우가 공급한 청크가 방출 지점과 일치하면 즉시 병합/방출
    pub fn add_chunk(&self, flow: &str, chunk_no: u64, payload: ChunkPayload) {
        let mut buf = self.buffer.lock();

        if !buf.node_buffers.contains_key(flow) {
            warn!("미지의 플로우에서 청크 수신: {}", flow);
            return;
        }

        if payload.is_empty() {
            warn!("플로우 {}의 빈 청크 {} 무시", flow, chunk_no);
            return;
        }

        if chunk_no < buf.next_release || buf.node_buffers[flow].contains_key(&chunk_no) {
            debug!("플로우 {}의 중복 청크 {} 무시", flow, chunk_no);
            return;
        }

        let total_size: usize = payload.values().map(|d| d.content.len()).sum();
        debug!(
            "플로우 {} 청크 {} 수신: {} bytes, {} 세그먼트",
            flow,
            chunk_no,
            total_size,
            payload.len()
        );

        if let Some(node_buffer) = buf.node_buffers.get_mut(flow) {
            node_buffer.insert(chunk_no, payload);
        }

        // 최고 수신 번호 갱신 시 pacing 재계산
        let updated = match buf.highest_chunk.get(flow) {
            Some(&old) if chunk_no <= old => false,
            _ => {
                buf.highest_chunk.insert(flow.to_string(), chunk_no);
                true
            }
        };
        if updated {
            self.update_flow_control_status(&mut buf);
        }

        *buf.completion_count.entry(chunk_no).or_insert(0) += 1;

        if buf.completion_count[&chunk_no] == self.flow_names.len() {
            debug!("모든 플로우가 청크 {} 공급", chunk_no);
            if chunk_no == buf.next_release {
                self.release_in_order(&mut buf);
            }
        }
    }

    /// 방출 지점부터 연속으로 완성된 청크를 순서대로 방출
    fn release_in_order(&self, buf: &mut ChunkBuffer) {
        while buf
            .completion_count
            .get(&buf.next_release)
            .is_some_and(|&count| count == self.flow_names.len())
        {
            let chunk_no = buf.next_release;
            self.release_chunk(buf, chunk_no);
            buf.next_release = chunk_no + 1;
        }
    }

    fn release_chunk(&self, buf: &mut ChunkBuffer, chunk_no: u64) {
        let merged = self.average_chunks(buf, chunk_no);

        for node_buffer in buf.node_buffers.values_mut() {
            node_buffer.remove(&chunk_no);
        }
        buf.completion_count.remove(&chunk_no);

        if merged.is_empty() {
            warn!("청크 {} 병합 결과가 비어 있음", chunk_no);
            return;
        }

        let total_size: usize = merged.values().map(|d| d.content.len()).sum();
        info!(
            "청크 {} 방출: {} bytes, {} 세그먼트",
            chunk_no,
            total_size,
            merged.len()
        );

        let _ = self.output_tx.send(MergedChunk {
            chunk_no,
            segments: merged,
        });
    }

    /// 남아 있는 완성 청크를 번호 오름차순으로 모두 방출
    pub fn process_available_chunks(&self) {
        let mut buf = self.buffer.lock();

        let complete: Vec<u64> = buf
            .completion_count
            .iter()
            .filter(|&(_, &count)| count == self.flow_names.len())
            .map(|(&chunk_no, _)| chunk_no)
            .collect();

        for chunk_no in complete {
            debug!("일괄 처리로 청크 {} 방출", chunk_no);
            self.release_chunk(&mut buf, chunk_no);
            buf.next_release = buf.next_release.max(chunk_no + 1);
        }
    }

    /// 여러 플로우의 같은 청크를 바이트 평균으로 병합
    ///
    /// 서브 세그먼트 인덱스 합집합을 대상으로, 단일 공급이면 그대로 복사,
    /// 복수 공급이면 최단 길이까지 바이트별 절사 평균.
    /// 이름/freshness 등 메타데이터는 첫 공급자 것을 사용
    fn average_chunks(&self, buf: &ChunkBuffer, chunk_no: u64) -> ChunkPayload {
        let contributions: Vec<&ChunkPayload> = self
            .flow_names
            .iter()
            .filter_map(|flow| buf.node_buffers.get(flow).and_then(|b| b.get(&chunk_no)))
            .collect();

        if contributions.is_empty() {
            warn!("청크 {}의 데이터 없음", chunk_no);
            return ChunkPayload::new();
        }

        if contributions.len() == 1 {
            return contributions[0].clone();
        }

        let all_segments: BTreeSet<u64> = contributions
            .iter()
            .flat_map(|payload| payload.keys().copied())
            .collect();

        let mut result = ChunkPayload::new();

        for seg_no in all_segments {
            let segment_data: Vec<&Data> = contributions
                .iter()
                .filter_map(|payload| payload.get(&seg_no))
                .collect();

            let Some(&first) = segment_data.first() else {
                continue;
            };

            if segment_data.len() == 1 {
                result.insert(seg_no, first.clone());
                continue;
            }

            let min_size = segment_data
                .iter()
                .map(|d| d.content.len())
                .min()
                .unwrap_or(0);
            if min_size == 0 {
                result.insert(seg_no, first.clone());
                continue;
            }

            let mut averaged = vec![0u8; min_size];
            for (i, byte) in averaged.iter_mut().enumerate() {
                let sum: u64 = segment_data.iter().map(|d| d.content[i] as u64).sum();
                *byte = (sum / segment_data.len() as u64) as u8;
            }

            let mut merged = Data::new(first.name.clone(), Bytes::from(averaged));
            merged.freshness_ms = first.freshness_ms;
            merged.final_block_id = first.final_block_id;
            result.insert(seg_no, merged);
        }

        debug!(
            "{}개 플로우의 청크 {} 병합: {} 세그먼트",
            contributions.len(),
            chunk_no,
            result.len()
        );

        result
    }

    /// pacing 상태 재계산
    ///
    /// 한 청크 이상 받은 플로우들의 최고 번호 최솟값을 기준으로,
    /// 격차가 table_size를 넘는 플로우를 멈춘다
    fn update_flow_control_status(&self, buf: &mut ChunkBuffer) {
        let Some(min_highest) = buf.highest_chunk.values().copied().min() else {
            return;
        };

        let mut resumed = false;
        for flow in &self.flow_names {
            let Some(&highest) = buf.highest_chunk.get(flow) else {
                continue;
            };
            let should_pause = highest - min_highest > self.table_size;
            let paused = buf.paused.entry(flow.clone()).or_insert(false);

            if should_pause && !*paused {
                *paused = true;
                warn!(
                    "플로우 {} 일시정지: {} 청크 앞섬 (한도 {})",
                    flow,
                    highest - min_highest,
                    self.table_size
                );
            } else if !should_pause && *paused {
                *paused = false;
                resumed = true;
                info!(
                    "플로우 {} 재개: {} 청크 앞섬 (한도 {} 이내)",
                    flow,
                    highest - min_highest,
                    self.table_size
                );
            }
        }

        if resumed {
            self.unpause.notify_waiters();
        }
    }

    /// 플로우가 너무 앞서 있어 새 전송을 멈춰야 하는지
    pub fn should_pause_flow(&self, flow: &str) -> bool {
        let buf = self.buffer.lock();
        match buf.paused.get(flow) {
            Some(&paused) => paused,
            None => {
                warn!("미지의 플로우 pause 조회: {}", flow);
                false
            }
        }
    }

    /// 플로우 pause 상태 강제 해제
    pub fn reset_pause_status(&self, flow: &str) {
        let mut buf = self.buffer.lock();
        match buf.paused.get_mut(flow) {
            Some(paused) => {
                *paused = false;
                info!("플로우 {} pause 수동 해제", flow);
                self.unpause.notify_waiters();
            }
            None => warn!("미지의 플로우 pause 해제 시도: {}", flow),
        }
    }

    /// 어떤 플로우든 재개될 때까지 대기
    ///
    /// 깨어난 뒤에는 `should_pause_flow`를 다시 확인해야 한다
    pub async fn unpaused(&self) {
        self.unpause.notified().await;
    }

    /// 수신 바이트 집계 (플로우 스레드들이 호출)
    pub fn add_received_bytes(&self, bytes: usize) {
        self.buffer.lock().received_bytes += bytes as u64;
    }

    /// 집계된 수신 바이트를 읽고 0으로 리셋
    pub fn take_received_bytes(&self) -> u64 {
        let mut buf = self.buffer.lock();
        std::mem::take(&mut buf.received_bytes)
    }
}

//! AggFlow 소비자 - 멀티플로우 청크 수집/집계 파이프라인
//!
//! 토폴로지 파일의 루트 직계 자식마다 플로우를 만들어 청크를 병렬 수집하고,
//! 평균 병합된 청크를 번호 순으로 출력 파일에 기록한다.
//! 포워더/생산자 계층은 외부 협력자이므로, 이 바이너리는 인프로세스
//! 루프백 생산자를 붙여 전체 소비자 스택을 끝까지 구동한다
//!
//! 사용법:
//!   cargo run --release --bin aggflow-consumer -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수집
//!   cargo run --release --bin aggflow-consumer -- -t topologies/Linetest.conf -o output.bin
//!
//!   # CUBIC 파이프라인, 청크 20개
//!   cargo run --release --bin aggflow-consumer -- -t topo.conf -p cubic -c 20 -o out.bin

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use aggflow::discover::{encode_versioned_name, METADATA_COMPONENT};
use aggflow::fanout::INIT_COMPONENT;
use aggflow::stats::{format_throughput, StatsRegistry};
use aggflow::{
    AggTree, Component, Config, Data, Face, FaceServer, FlowFanout, Nack, NackReason,
    PipelineType,
};

/// 소비자 실행 설정
struct ConsumerConfig {
    output_path: Option<PathBuf>,
    /// 시뮬레이션 생산자의 청크당 세그먼트 수
    sim_segments: u64,
    /// 시뮬레이션 생산자의 세그먼트 크기
    sim_segment_size: usize,
    log_level: Level,
    config: Config,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            sim_segments: 8,
            sim_segment_size: 1024,
            log_level: Level::INFO,
            config: Config::default(),
        }
    }
}

fn print_help() {
    println!(
        r#"AggFlow Consumer - 멀티플로우 청크 수집/집계 파이프라인

토폴로지의 루트 직계 자식마다 플로우 하나를 만들어 혼잡 제어 윈도우로
청크를 수집하고, 모든 플로우의 같은 청크를 평균 병합해 순서대로 기록한다.

사용법:
  cargo run --release --bin aggflow-consumer -- [OPTIONS]

옵션:
  -t, --topology <PATH>   토폴로지 파일 경로
      --root <NAME>       트리 루트 노드 이름 (기본: con0)
  -c, --chunks <N>        플로우당 청크 수 (기본: 5)
  -f, --faces <N>         전송 엔드포인트 수 (기본: 2)
  -p, --pipeline <TYPE>   혼잡 제어: aimd|cubic|bic|hybla|highspeed (기본: aimd)
  -o, --output <PATH>     병합 청크 기록 경로
      --table-size <N>    플로우 간 허용 청크 격차 (기본: 10)
      --lifetime-ms <MS>  요청 수명 (기본: 4000)
      --retries <N>       타임아웃/Nack 재시도 상한, -1 무제한 (기본: 15)
      --segments <N>      [시뮬레이션] 청크당 세그먼트 수 (기본: 8)
      --segment-size <B>  [시뮬레이션] 세그먼트 크기 (기본: 1024)
  -q, --quiet             요약 출력 억제
  -v, --verbose           debug 로그 출력
  -h, --help              이 도움말 출력
"#
    );
}

fn parse_args() -> ConsumerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut consumer = ConsumerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--topology" | "-t" => {
                if i + 1 < args.len() {
                    consumer.config.topo_file = args[i + 1].clone();
                    i += 1;
                }
            }
            "--root" => {
                if i + 1 < args.len() {
                    consumer.config.root_node = args[i + 1].clone();
                    i += 1;
                }
            }
            "--chunks" | "-c" => {
                if i + 1 < args.len() {
                    consumer.config.total_chunks = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--faces" | "-f" => {
                if i + 1 < args.len() {
                    consumer.config.num_faces = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--pipeline" | "-p" => {
                if i + 1 < args.len() {
                    consumer.config.pipeline_type = args[i + 1]
                        .parse::<PipelineType>()
                        .expect("유효한 파이프라인 종류 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    consumer.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--table-size" => {
                if i + 1 < args.len() {
                    consumer.config.table_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--lifetime-ms" => {
                if i + 1 < args.len() {
                    let ms: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    consumer.config.interest_lifetime = Duration::from_millis(ms);
                    i += 1;
                }
            }
            "--retries" => {
                if i + 1 < args.len() {
                    consumer.config.max_retries_on_timeout_or_nack =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--segments" => {
                if i + 1 < args.len() {
                    consumer.sim_segments = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--segment-size" => {
                if i + 1 < args.len() {
                    consumer.sim_segment_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--quiet" | "-q" => {
                consumer.config.quiet = true;
                consumer.log_level = Level::WARN;
            }
            "--verbose" | "-v" => {
                consumer.log_level = Level::DEBUG;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("알 수 없는 옵션: {other}");
                print_help();
                std::process::exit(2);
            }
        }
        i += 1;
    }

    consumer
}

/// 리프/청크/세그먼트로 결정되는 시뮬레이션 콘텐츠
fn sim_content(flow: &str, chunk_no: u64, seg_no: u64, size: usize) -> Bytes {
    let seed = flow
        .bytes()
        .fold(chunk_no.wrapping_mul(31).wrapping_add(seg_no), |acc, b| {
            acc.wrapping_mul(131).wrapping_add(b as u64)
        });
    let bytes: Vec<u8> = (0..size)
        .map(|i| (seed.wrapping_add(i as u64).wrapping_mul(2654435761) >> 16) as u8)
        .collect();
    Bytes::from(bytes)
}

/// 인프로세스 루프백 생산자
///
/// init 핸드셰이크, 버전 메타데이터, 세그먼트 요청에 응답한다
fn spawn_sim_producer(mut server: FaceServer, segments_per_chunk: u64, segment_size: usize) {
    tokio::spawn(async move {
        while let Some(req) = server.recv().await {
            let interest = match req.interest() {
                Ok(i) => i,
                Err(e) => {
                    warn!("요청 디코딩 실패: {}", e);
                    continue;
                }
            };
            let name = interest.name.clone();
            let flow = name.flow_id().unwrap_or_default().to_string();

            // 핸드셰이크
            if matches!(name.last(), Some(Component::Generic(c)) if c == INIT_COMPONENT) {
                req.reply_data(Data::new(name, Bytes::from_static(b"init-ack")));
                continue;
            }

            // 버전 디스커버리
            if matches!(name.last(), Some(Component::Generic(c)) if c == METADATA_COMPONENT) {
                let mut prefix = aggflow::Name::new();
                for i in 0..name.len() - 1 {
                    if let Some(component) = name.get(i) {
                        prefix = prefix.append(component.clone());
                    }
                }
                let versioned = prefix.append_version(1);
                req.reply_data(Data::new(name, encode_versioned_name(&versioned)));
                continue;
            }

            // 세그먼트 요청
            let Some(seg_no) = name.segment() else {
                continue;
            };
            let chunk_no: u64 = (0..name.len())
                .filter_map(|i| match name.get(i) {
                    Some(Component::Generic(s)) => s.parse().ok(),
                    _ => None,
                })
                .next_back()
                .unwrap_or(0);

            let last = segments_per_chunk.saturating_sub(1);
            if seg_no > last {
                req.reply_nack(Nack {
                    name,
                    reason: NackReason::NoRoute,
                });
                continue;
            }

            let content = sim_content(&flow, chunk_no, seg_no, segment_size);
            req.reply_data(Data::new(name, content).with_final_block_id(last));
        }
    });
}

#[tokio::main]
async fn main() -> aggflow::Result<()> {
    let consumer = parse_args();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(consumer.log_level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let topology_text = fs::read_to_string(&consumer.config.topo_file)?;
    let tree = AggTree::parse(&topology_text)?;
    info!(
        "토폴로지 로드: {} ({}개 노드)",
        consumer.config.topo_file,
        tree.node_count()
    );

    let config = Arc::new(consumer.config);
    let stats = Arc::new(StatsRegistry::new());

    // face 생성 + 루프백 생산자 연결
    let mut faces = Vec::with_capacity(config.num_faces);
    for i in 0..config.num_faces.max(1) {
        let (face, server) = Face::channel(i, 256);
        spawn_sim_producer(server, consumer.sim_segments, consumer.sim_segment_size);
        faces.push(face);
    }

    let (fanout, mut chunk_rx) = FlowFanout::new(&tree, faces, config.clone(), stats.clone())?;
    let controller = fanout.controller();

    // 병합 청크를 순서대로 기록
    let output_path = consumer.output_path.clone();
    let writer = tokio::spawn(async move {
        let mut file = match &output_path {
            Some(path) => match fs::File::create(path) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("출력 파일 생성 실패 ({}): {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        let mut total: u64 = 0;
        while let Some(merged) = chunk_rx.recv().await {
            let chunk_no = merged.chunk_no;
            let bytes = merged.into_bytes();
            total += bytes.len() as u64;
            if let Some(f) = file.as_mut() {
                if let Err(e) = f.write_all(&bytes).and_then(|_| f.flush()) {
                    warn!("청크 {} 기록 실패: {}", chunk_no, e);
                }
            }
        }
        total
    });

    // 주기적 goodput 기록
    let goodput_controller = controller.clone();
    let cycle = config.recording_cycle;
    let goodput = tokio::spawn(async move {
        let mut timer = tokio::time::interval(cycle);
        timer.tick().await;
        loop {
            timer.tick().await;
            let bytes = goodput_controller.take_received_bytes();
            let throughput = bytes as f64 * 8.0 / cycle.as_secs_f64();
            info!("수신 처리량: {}", format_throughput(throughput));
        }
    });

    let result = fanout.run().await;
    goodput.abort();
    let _ = goodput.await;

    // 컨트롤러 핸들을 전부 놓아야 출력 채널이 닫힌다
    drop(controller);
    let total_written = writer.await.unwrap_or(0);

    if !config.quiet {
        println!("{}", stats.summary());
        for line in stats.per_flow_summaries() {
            println!("{line}");
        }
        println!("출력 바이트: {total_written}");
    }

    result
}

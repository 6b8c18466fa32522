//! 프로토콜 설정

use std::str::FromStr;
use std::time::Duration;

/// 혼잡 제어 파이프라인 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineType {
    #[default]
    Aimd,
    Cubic,
    Bic,
    Hybla,
    Highspeed,
}

impl FromStr for PipelineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aimd" => Ok(PipelineType::Aimd),
            "cubic" => Ok(PipelineType::Cubic),
            "bic" => Ok(PipelineType::Bic),
            "hybla" => Ok(PipelineType::Hybla),
            "highspeed" => Ok(PipelineType::Highspeed),
            other => Err(format!("알 수 없는 파이프라인 종류: '{other}'")),
        }
    }
}

/// RTT 추정기 파라미터
#[derive(Debug, Clone)]
pub struct RttOptions {
    /// 평활 RTT 가중치
    pub alpha: f64,

    /// RTT 분산 가중치
    pub beta: f64,

    /// RTO = srtt + k * rttvar 의 k
    pub k: u32,

    /// 첫 샘플 이전의 RTO
    pub initial_rto: Duration,

    /// RTO 하한
    pub min_rto: Duration,

    /// RTO 상한
    pub max_rto: Duration,

    /// 손실 이벤트 시 RTO 배수
    pub backoff_multiplier: f64,
}

impl Default for RttOptions {
    fn default() -> Self {
        Self {
            alpha: 0.125,
            beta: 0.25,
            k: 8,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

/// AggFlow 소비자 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 요청 수명 (이 시간 안에 응답 없으면 타임아웃)
    pub interest_lifetime: Duration,

    /// 타임아웃/Nack 재시도 상한 (-1이면 무제한)
    pub max_retries_on_timeout_or_nack: i32,

    /// 버전 디스커버리 비활성화 (이름을 그대로 사용)
    pub disable_version_discovery: bool,

    /// 캐시 응답 거부 (fresh 데이터만)
    pub must_be_fresh: bool,

    /// 요약 출력 억제
    pub quiet: bool,

    /// 혼잡 제어 파이프라인 종류
    pub pipeline_type: PipelineType,

    /// 초기 혼잡 윈도우 (세그먼트 단위)
    pub init_cwnd: f64,

    /// 초기 슬로우스타트 임계값
    pub init_ssthresh: f64,

    /// 재전송 타이머 점검 주기
    pub rto_check_interval: Duration,

    /// 혼잡 마크 수신 시 윈도우 감소 생략
    pub ignore_cong_marks: bool,

    /// Conservative Window Adaptation 비활성화
    pub disable_cwa: bool,

    /// AIMD 가산 증가 스텝
    pub ai_step: f64,

    /// AIMD 승산 감소 계수
    pub md_coef: f64,

    /// 손실 이벤트 시 윈도우를 초기값으로 리셋
    pub reset_cwnd_to_init: bool,

    /// CUBIC 승산 감소 계수
    pub cubic_beta: f64,

    /// CUBIC fast convergence 사용
    pub enable_fast_conv: bool,

    /// Highspeed 기본 증가 계수
    pub hscc_growth_factor: f64,

    /// Highspeed 감소 계수
    pub hscc_reduction_factor: f64,

    /// Highspeed 대역폭 지수
    pub bandwidth_exp: f64,

    /// Highspeed BDP 스케일 계수
    pub bdp_scale: f64,

    /// 플로우당 수집할 총 청크 수
    pub total_chunks: u64,

    /// 플로우 간 허용 청크 격차 (pacing 테이블 크기)
    pub table_size: u64,

    /// 전송 엔드포인트(face) 수
    pub num_faces: usize,

    /// 집계 트리 루트 노드 이름
    pub root_node: String,

    /// 토폴로지 파일 경로
    pub topo_file: String,

    /// 처리량 기록 주기
    pub recording_cycle: Duration,

    /// RTT 추정기 파라미터
    pub rtt: RttOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interest_lifetime: Duration::from_secs(4),
            max_retries_on_timeout_or_nack: 15,
            disable_version_discovery: true,
            must_be_fresh: false,
            quiet: false,
            pipeline_type: PipelineType::Aimd,
            init_cwnd: 2.0,
            init_ssthresh: f64::MAX,
            rto_check_interval: Duration::from_millis(10),
            ignore_cong_marks: false,
            disable_cwa: false,
            ai_step: 1.0,
            md_coef: 0.5,
            reset_cwnd_to_init: false,
            cubic_beta: 0.7,
            enable_fast_conv: false,
            hscc_growth_factor: 0.01,
            hscc_reduction_factor: 0.2,
            bandwidth_exp: 0.8,
            bdp_scale: 1.1,
            total_chunks: 5,
            table_size: 10,
            num_faces: 2,
            root_node: "con0".to_string(),
            topo_file: "topologies/Linetest.conf".to_string(),
            recording_cycle: Duration::from_secs(1),
            rtt: RttOptions::default(),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 위성망 등 장지연 링크용 설정
    pub fn long_delay_link() -> Self {
        Self {
            pipeline_type: PipelineType::Hybla,
            interest_lifetime: Duration::from_secs(8),
            rtt: RttOptions {
                initial_rto: Duration::from_secs(3),
                min_rto: Duration::from_millis(500),
                ..RttOptions::default()
            },
            ..Self::default()
        }
    }

    /// 고대역폭 저지연(데이터센터)용 설정
    pub fn datacenter() -> Self {
        Self {
            pipeline_type: PipelineType::Highspeed,
            init_cwnd: 4.0,
            interest_lifetime: Duration::from_secs(1),
            rto_check_interval: Duration::from_millis(2),
            rtt: RttOptions {
                initial_rto: Duration::from_millis(200),
                min_rto: Duration::from_millis(20),
                ..RttOptions::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_type_parse() {
        assert_eq!("aimd".parse::<PipelineType>().unwrap(), PipelineType::Aimd);
        assert_eq!(
            "highspeed".parse::<PipelineType>().unwrap(),
            PipelineType::Highspeed
        );
        assert!("reno".parse::<PipelineType>().is_err());
    }

    #[test]
    fn test_presets() {
        let satellite = Config::long_delay_link();
        assert_eq!(satellite.pipeline_type, PipelineType::Hybla);
        assert!(satellite.rtt.initial_rto > Config::default().rtt.initial_rto);

        let dc = Config::datacenter();
        assert_eq!(dc.pipeline_type, PipelineType::Highspeed);
        assert!(dc.rto_check_interval < Config::default().rto_check_interval);
    }
}

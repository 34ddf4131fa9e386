use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

use tuner_core::config::PipelineConfig;
use tuner_core::{
    AudioBuffer, CaptureStream, DetectedPitch, DropPolicy, EstimatorKind, ReadError, ReplayStream,
    SampleEncoding, StreamFormat, TunerConfig, TunerError, TuningSession,
};

const SAMPLE_RATE: u32 = 44_100;
/// Bitstream window at 44.1 kHz with the default 60 Hz floor.
const WINDOW: usize = 2048;

/// One window per entry, in order: A2 D3 G3 B3 E4 A4 D5 G5.
const MELODY: [(f32, &str); 8] = [
    (110.0, "A2"),
    (146.83, "D3"),
    (196.0, "G3"),
    (246.94, "B3"),
    (329.63, "E4"),
    (440.0, "A4"),
    (587.33, "D5"),
    (783.99, "G5"),
];

fn config(queue_capacity: usize, drop_policy: DropPolicy) -> TunerConfig {
    TunerConfig {
        estimator: EstimatorKind::Bitstream,
        pipeline: PipelineConfig {
            queue_capacity,
            drop_policy,
            read_timeout_ms: 50,
        },
        ..TunerConfig::default()
    }
}

fn sine(frequency: f32, sample_rate: u32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.8
        })
        .collect()
}

fn melody_samples() -> Vec<f32> {
    MELODY.iter().flat_map(|&(f, _)| sine(f, SAMPLE_RATE, WINDOW)).collect()
}

/// Interleaved 16-bit stereo with the signal on both channels.
fn stereo_i16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let v = ((s * 32_767.0) as i16).to_le_bytes();
            [v[0], v[1], v[0], v[1]]
        })
        .collect()
}

/// Cuts `bytes` into buffers of random length, frames split included.
fn random_chunks(bytes: &[u8], format: StreamFormat, seed: u64) -> Vec<AudioBuffer> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buffers = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let len = rng.gen_range(1..3000).min(bytes.len() - offset);
        buffers.push(AudioBuffer {
            format,
            bytes: bytes[offset..offset + len].to_vec(),
        });
        offset += len;
    }
    buffers
}

type Readings = Arc<Mutex<Vec<DetectedPitch>>>;

fn recorder() -> (Readings, impl FnMut(DetectedPitch) + Send + 'static) {
    let readings: Readings = Arc::default();
    let sink = {
        let readings = Arc::clone(&readings);
        move |pitch: DetectedPitch| readings.lock().unwrap().push(pitch)
    };
    (readings, sink)
}

fn names(readings: &Readings) -> Vec<String> {
    readings.lock().unwrap().iter().map(|p| p.fundamental.to_string()).collect()
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
fn results_follow_window_order_across_any_split(#[case] seed: u64) {
    let format = StreamFormat::new(SAMPLE_RATE, 16, 2, SampleEncoding::Int);
    let mut bytes = stereo_i16(&melody_samples());
    bytes.extend_from_slice(&[1, 2, 3]); // trailing partial frame

    let stream = ReplayStream::from_buffers(random_chunks(&bytes, format, seed));
    let (readings, sink) = recorder();
    let session =
        TuningSession::start(Box::new(stream), config(16, DropPolicy::DropNewest), sink).unwrap();
    wait_until("session end", || session.is_finished());
    let stats = session.stats();
    session.wait().unwrap();

    let expected: Vec<String> = MELODY.iter().map(|&(_, name)| name.to_string()).collect();
    assert_eq!(names(&readings), expected);
    assert_eq!(stats.windows, 8);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.detections, 8);
}

/// Serves its buffers in order but holds back everything after the first
/// until the detection worker is busy with it.
struct GatedStream {
    buffers: VecDeque<AudioBuffer>,
    gate: Receiver<()>,
    served: usize,
}

impl CaptureStream for GatedStream {
    fn read(&mut self, _timeout: Duration) -> Result<Option<AudioBuffer>, ReadError> {
        if self.served == 1 {
            let _ = self.gate.recv_timeout(Duration::from_secs(10));
        }
        self.served += 1;
        Ok(self.buffers.pop_front())
    }

    fn stop(&mut self) {
        self.buffers.clear();
    }
}

#[rstest]
#[case(DropPolicy::DropNewest, ["A2", "D3"])]
#[case(DropPolicy::DropOldest, ["A2", "G5"])]
fn busy_worker_applies_drop_policy(#[case] policy: DropPolicy, #[case] expected: [&str; 2]) {
    let (busy_tx, busy_rx) = crossbeam_channel::bounded::<()>(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let stream = GatedStream {
        buffers: MELODY
            .iter()
            .map(|&(f, _)| AudioBuffer::from_samples(SAMPLE_RATE, &sine(f, SAMPLE_RATE, WINDOW)))
            .collect(),
        gate: busy_rx,
        served: 0,
    };

    let readings: Readings = Arc::default();
    let sink = {
        let readings = Arc::clone(&readings);
        let mut first = true;
        move |pitch: DetectedPitch| {
            if first {
                first = false;
                let _ = busy_tx.send(());
                let _ = release_rx.recv();
            }
            readings.lock().unwrap().push(pitch);
        }
    };

    let session = TuningSession::start(Box::new(stream), config(1, policy), sink).unwrap();
    wait_until("all windows offered", || session.stats().windows == 8);
    release_tx.send(()).unwrap();
    wait_until("session end", || session.is_finished());

    let stats = session.stats();
    session.wait().unwrap();
    assert_eq!(stats.dropped, 6);
    assert_eq!(stats.detections, 2);
    assert_eq!(names(&readings), expected);
}

#[test]
fn a_single_failed_read_is_retried() {
    let samples = sine(440.0, SAMPLE_RATE, WINDOW);
    let stream = ReplayStream::new(vec![
        Ok(AudioBuffer::from_samples(SAMPLE_RATE, &samples[..1000])),
        Err(ReadError::Device("buffer overrun".into())),
        Ok(AudioBuffer::from_samples(SAMPLE_RATE, &samples[1000..])),
        Err(ReadError::Timeout(Duration::from_millis(50))),
        Ok(AudioBuffer::from_samples(SAMPLE_RATE, &samples)),
    ]);
    let (readings, sink) = recorder();
    let session =
        TuningSession::start(Box::new(stream), config(4, DropPolicy::DropNewest), sink).unwrap();
    wait_until("session end", || session.is_finished());
    session.wait().unwrap();
    assert_eq!(names(&readings), vec!["A4", "A4"]);
}

#[test]
fn two_consecutive_failures_end_the_session() {
    let samples = sine(440.0, SAMPLE_RATE, WINDOW);
    let stream = ReplayStream::new(vec![
        Ok(AudioBuffer::from_samples(SAMPLE_RATE, &samples)),
        Err(ReadError::Device("unplugged".into())),
        Err(ReadError::Device("unplugged".into())),
        Ok(AudioBuffer::from_samples(SAMPLE_RATE, &samples)),
    ]);
    let (readings, sink) = recorder();
    let session =
        TuningSession::start(Box::new(stream), config(4, DropPolicy::DropNewest), sink).unwrap();
    wait_until("session end", || session.is_finished());

    let err = session.wait().unwrap_err();
    assert!(matches!(err, TunerError::DeviceReadFailure(_)), "{err}");
    assert_eq!(names(&readings), vec!["A4"]);
}

#[test]
fn unsupported_encoding_is_fatal() {
    let format = StreamFormat::new(SAMPLE_RATE, 24, 1, SampleEncoding::Int);
    let stream = ReplayStream::from_buffers(vec![AudioBuffer {
        format,
        bytes: vec![0; 3 * WINDOW],
    }]);
    let (readings, sink) = recorder();
    let session =
        TuningSession::start(Box::new(stream), config(1, DropPolicy::DropNewest), sink).unwrap();
    wait_until("session end", || session.is_finished());

    assert_eq!(
        session.wait(),
        Err(TunerError::UnsupportedFormat {
            bits_per_sample: 24,
            encoding: SampleEncoding::Int
        })
    );
    assert!(readings.lock().unwrap().is_empty());
}

#[test]
fn format_change_rebuilds_the_pipeline() {
    let first = sine(440.0, 44_100, WINDOW + WINDOW / 2);
    let second = sine(440.0, 48_000, 2 * WINDOW);
    let stream = ReplayStream::from_buffers(vec![
        AudioBuffer::from_samples(44_100, &first),
        AudioBuffer::from_samples(48_000, &second),
    ]);
    let (readings, sink) = recorder();
    let session =
        TuningSession::start(Box::new(stream), config(4, DropPolicy::DropNewest), sink).unwrap();
    wait_until("session end", || session.is_finished());
    let stats = session.stats();
    session.wait().unwrap();

    // The half window left over at 44.1 kHz is discarded.
    assert_eq!(stats.windows, 3);
    assert_eq!(names(&readings), vec!["A4", "A4", "A4"]);
}

#[test]
fn no_results_after_stop() {
    let chunk = sine(440.0, SAMPLE_RATE, 512);
    let buffers = (0..10_000).map(|_| AudioBuffer::from_samples(SAMPLE_RATE, &chunk));
    let stream = ReplayStream::from_buffers(buffers).paced(Duration::from_millis(1));
    let count = Arc::new(AtomicUsize::new(0));
    let sink = {
        let count = Arc::clone(&count);
        move |_: DetectedPitch| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    };

    let session =
        TuningSession::start(Box::new(stream), config(1, DropPolicy::DropOldest), sink).unwrap();
    wait_until("some detections", || count.load(Ordering::SeqCst) >= 2);
    session.stop().unwrap();

    let after_stop = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), after_stop);
}

#[test]
fn invalid_config_is_rejected_at_start() {
    let config = config(0, DropPolicy::DropNewest);
    let err = TuningSession::start(Box::new(ReplayStream::default()), config, |_| {}).unwrap_err();
    assert!(matches!(err, TunerError::InvalidConfig(_)));
}

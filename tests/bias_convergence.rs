//! Bias block transactions and closed-loop convergence against a simulated block.

use labctl::adapters::{MockDevice, MockFraming};
use labctl::config::BiasBlockConfig;
use labctl::motion::{BiasBlock, MockBiasBlock};
use labctl::{FailureCategory, InstrumentError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn options(max_attempts: u32) -> BiasBlockConfig {
    BiasBlockConfig {
        max_attempts,
        backoff_ms: 50,
        settle_ms: 300,
        buffer_size: 256,
    }
}

fn block_with<F>(responder: F, max_attempts: u32) -> (BiasBlock, MockDevice)
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let (conn, device) = MockDevice::spawn("bias", MockFraming::Raw, responder);
    (BiasBlock::new(Arc::new(Mutex::new(conn)), &options(max_attempts)), device)
}

#[tokio::test(start_paused = true)]
async fn test_exact_block_converges_on_first_iteration() {
    let (block, device) = block_with(MockBiasBlock::new().into_responder(), 3);

    let volts = block
        .set_bias_voltage_iterative(4, 0.005, 0.001, 10, &CancellationToken::new())
        .await
        .unwrap();

    assert!((volts - 0.005).abs() < 1e-9);
    assert_eq!(
        device.requests().await,
        vec!["BIAS:DEV4:VOLT 0.005", "BIAS:DEV4:VOLT"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_gain_error_is_corrected_iteratively() {
    let (block, device) = block_with(MockBiasBlock::new().with_gain(0.8).into_responder(), 3);

    let volts = block
        .set_bias_voltage_iterative(1, 1.0, 0.001, 10, &CancellationToken::new())
        .await
        .unwrap();

    assert!((volts - 1.0).abs() <= 0.001);
    // Error shrinks by a factor 5 per round: 0.2, 0.04, 0.008, 0.0016, 0.00032.
    assert_eq!(device.requests().await.len(), 2 * 5);
}

#[tokio::test(start_paused = true)]
async fn test_constant_offset_converges_on_second_iteration() {
    let (block, device) = block_with(MockBiasBlock::new().with_offset(0.01).into_responder(), 3);

    block
        .set_bias_voltage_iterative(1, 1.0, 0.001, 10, &CancellationToken::new())
        .await
        .unwrap();

    let requests = device.requests().await;
    assert_eq!(requests.len(), 4);
    assert!(requests[2].starts_with("BIAS:DEV1:VOLT 0.9"));
}

#[tokio::test(start_paused = true)]
async fn test_noise_below_tolerance_always_converges() {
    for seed in 0..16 {
        let block_sim = MockBiasBlock::new().with_noise(0.0009, seed);
        let (block, _device) = block_with(block_sim.into_responder(), 3);
        let result = block
            .set_bias_voltage_iterative(2, 1.0, 0.001, 5, &CancellationToken::new())
            .await;
        assert!(result.is_ok(), "seed {seed}: {result:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_dead_block_reports_convergence_failure() {
    let (block, device) = block_with(MockBiasBlock::new().with_gain(0.0).into_responder(), 3);

    let err = block
        .set_bias_voltage_iterative(3, 0.5, 0.01, 3, &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        InstrumentError::ConvergenceFailure {
            iterations,
            last_reading,
            ..
        } => {
            assert_eq!(*iterations, 3);
            assert_eq!(*last_reading, Some(0.0));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.category(), FailureCategory::NotConverged);
    assert_eq!(device.requests().await.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_manipulate_attempts_are_bounded() {
    let (block, device) = block_with(|_| Some(b"ERROR: interlock active".to_vec()), 4);

    let err = block.try_manipulate("BIAS:DEV1:VOLT 0.1").await.unwrap_err();
    assert!(matches!(err, InstrumentError::DeviceReported(_)));
    assert_eq!(device.requests().await.len(), 4);

    assert_eq!(block.manipulate("BIAS:DEV1:VOLT 0.1").await, "");
    assert_eq!(device.requests().await.len(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_getter_retries_non_numeric_answer() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let (block, device) = block_with(
        move |_| {
            let reply: &[u8] = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                b"BIAS:DEV1:VOLT ???"
            } else {
                b"BIAS:DEV1:VOLT 0.250"
            };
            Some(reply.to_vec())
        },
        3,
    );

    assert_eq!(block.voltage(1).await, Some(0.25));
    assert_eq!(device.requests().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_getter_retries_non_finite_answer() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let (block, device) = block_with(
        move |_| {
            let reply: &[u8] = match counter.fetch_add(1, Ordering::SeqCst) {
                0 => b"BIAS:DEV2:VOLT NaN",
                1 => b"BIAS:DEV2:VOLT inf",
                _ => b"BIAS:DEV2:VOLT 0.125",
            };
            Some(reply.to_vec())
        },
        3,
    );

    assert_eq!(block.voltage(2).await, Some(0.125));
    assert_eq!(device.requests().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_non_finite_reading_never_reaches_the_loop() {
    let (block, _device) = block_with(|_| Some(b"BIAS:DEV1:VOLT NaN".to_vec()), 2);
    let err = block
        .set_bias_voltage_iterative(1, 1.0, 0.001, 5, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InstrumentError::Protocol(_)), "{err}");
}

#[tokio::test(start_paused = true)]
async fn test_silent_block_gives_none_after_retries() {
    let (block, device) = block_with(|_| None, 3);
    assert_eq!(block.current(1).await, None);
    assert_eq!(device.requests().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_first_write() {
    let (block, device) = block_with(MockBiasBlock::new().into_responder(), 3);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = block
        .set_bias_voltage_iterative(1, 1.0, 0.001, 10, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.category(), FailureCategory::Cancelled);
    assert!(device.requests().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_settle_keeps_setpoint() {
    let (block, device) = block_with(MockBiasBlock::new().into_responder(), 3);
    let cancel = CancellationToken::new();

    let (result, ()) = tokio::join!(
        block.set_bias_voltage_iterative(1, 1.0, 0.001, 10, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        }
    );

    assert!(matches!(result, Err(InstrumentError::Cancelled)));
    assert_eq!(device.requests().await, vec!["BIAS:DEV1:VOLT 1"]);
}

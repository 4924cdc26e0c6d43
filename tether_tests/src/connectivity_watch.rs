use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether::channel::{Channel, ChannelError};
use tether::completion::CompletionQueue;
use tether::engine::loopback::LoopbackEngine;
use tether::engine::{ConnectivityState, Deadline, RpcEngine};
use tether::watch::{ChannelWatchExt, WatchOutcome};

async fn setup_channel() -> (Arc<LoopbackEngine>, CompletionQueue, Channel) {
    let loopback = Arc::new(LoopbackEngine::new());
    let engine: Arc<dyn RpcEngine> = loopback.clone();
    let queue = CompletionQueue::start().await.unwrap();
    let channel =
        Channel::connect(engine, queue.clone(), "localhost:0", None, None).unwrap();
    (loopback, queue, channel)
}

#[tokio::test]
pub async fn watch_resolves_on_state_change() -> anyhow::Result<()> {
    let (loopback, _queue, channel) = setup_channel().await;

    let outcomes: Arc<Mutex<Vec<WatchOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    let outcomes_clone = outcomes.clone();
    channel.watch_connectivity_state(
        ConnectivityState::Idle.raw(),
        Deadline::after(Duration::from_secs(5)),
        move |outcome| outcomes_clone.lock().unwrap().push(outcome),
    )?;

    loopback.transition("localhost:0", ConnectivityState::Ready);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![WatchOutcome::StateChanged(ConnectivityState::Ready)]
    );
    Ok(())
}

#[tokio::test]
pub async fn watch_resolves_immediately_when_state_already_differs() -> anyhow::Result<()> {
    let (loopback, _queue, channel) = setup_channel().await;

    loopback.transition("localhost:0", ConnectivityState::TransientFailure);

    let outcomes: Arc<Mutex<Vec<WatchOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    let outcomes_clone = outcomes.clone();
    channel.watch_connectivity_state(
        ConnectivityState::Idle.raw(),
        Deadline::after(Duration::from_secs(5)),
        move |outcome| outcomes_clone.lock().unwrap().push(outcome),
    )?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![WatchOutcome::StateChanged(ConnectivityState::TransientFailure)]
    );
    Ok(())
}

#[tokio::test]
pub async fn watch_times_out_as_a_callback_value() -> anyhow::Result<()> {
    let (_loopback, _queue, channel) = setup_channel().await;

    let (tx, rx) = futures::channel::oneshot::channel();
    channel.watch_connectivity_state(
        ConnectivityState::Idle.raw(),
        Deadline::after(Duration::from_millis(30)),
        move |outcome| {
            let _ = tx.send(outcome);
        },
    )?;

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx).await??;
    assert_eq!(outcome, WatchOutcome::DeadlineExceeded);
    Ok(())
}

#[tokio::test]
pub async fn epoch_millis_deadlines_are_honored() -> anyhow::Result<()> {
    let (_loopback, _queue, channel) = setup_channel().await;

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_millis() as f64;

    let (tx, rx) = futures::channel::oneshot::channel();
    channel.watch_connectivity_state(
        ConnectivityState::Idle.raw(),
        Deadline::from(now_ms + 50.0),
        move |outcome| {
            let _ = tx.send(outcome);
        },
    )?;

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx).await??;
    assert_eq!(outcome, WatchOutcome::DeadlineExceeded);
    Ok(())
}

#[tokio::test]
pub async fn bad_state_code_registers_nothing() -> anyhow::Result<()> {
    let (_loopback, queue, channel) = setup_channel().await;

    let err = channel
        .watch_connectivity_state(99, Deadline::Infinite, |_| {
            panic!("a rejected watch must never fire");
        })
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChannelError>(),
        Some(ChannelError::TypeMismatch(_))
    ));
    assert_eq!(queue.pending_ops().await?, 0);

    Ok(())
}

#[tokio::test]
pub async fn nan_deadline_registers_nothing() -> anyhow::Result<()> {
    let (_loopback, queue, channel) = setup_channel().await;

    let err = channel
        .watch_connectivity_state(
            ConnectivityState::Idle.raw(),
            Deadline::EpochMillis(f64::NAN),
            |_| panic!("a rejected watch must never fire"),
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChannelError>(),
        Some(ChannelError::TypeMismatch(_))
    ));
    assert_eq!(queue.pending_ops().await?, 0);

    Ok(())
}

#[tokio::test]
pub async fn closing_the_channel_resolves_pending_watches() -> anyhow::Result<()> {
    let (_loopback, _queue, channel) = setup_channel().await;

    let outcomes: Arc<Mutex<Vec<WatchOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    let outcomes_clone = outcomes.clone();
    channel.watch_connectivity_state(
        ConnectivityState::Idle.raw(),
        Deadline::after(Duration::from_secs(30)),
        move |outcome| outcomes_clone.lock().unwrap().push(outcome),
    )?;

    channel.close();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![WatchOutcome::StateChanged(ConnectivityState::Shutdown)]
    );
    Ok(())
}

#[tokio::test]
pub async fn concurrent_watches_resolve_independently() -> anyhow::Result<()> {
    let (loopback, _queue, channel) = setup_channel().await;

    let outcomes: Arc<Mutex<Vec<(&'static str, WatchOutcome)>>> = Arc::new(Mutex::new(Vec::new()));

    // resolves only once the state leaves Idle
    let outcomes_a = outcomes.clone();
    channel.watch_connectivity_state(
        ConnectivityState::Idle.raw(),
        Deadline::after(Duration::from_secs(5)),
        move |outcome| outcomes_a.lock().unwrap().push(("a", outcome)),
    )?;

    // already differs: the channel is Idle, not Ready
    let outcomes_b = outcomes.clone();
    channel.watch_connectivity_state(
        ConnectivityState::Ready.raw(),
        Deadline::after(Duration::from_secs(5)),
        move |outcome| outcomes_b.lock().unwrap().push(("b", outcome)),
    )?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    loopback.transition("localhost:0", ConnectivityState::Connecting);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut resolved = outcomes.lock().unwrap().clone();
    resolved.sort_by_key(|(who, _)| *who);
    assert_eq!(
        resolved,
        vec![
            ("a", WatchOutcome::StateChanged(ConnectivityState::Connecting)),
            ("b", WatchOutcome::StateChanged(ConnectivityState::Idle)),
        ]
    );
    Ok(())
}

#[tokio::test]
pub async fn async_wrapper_reports_the_transition() -> anyhow::Result<()> {
    let (loopback, _queue, channel) = setup_channel().await;

    let loopback_copy = loopback.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        loopback_copy.transition("localhost:0", ConnectivityState::Ready);
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        channel.next_state_change(
            ConnectivityState::Idle,
            Deadline::after(Duration::from_secs(5)),
        ),
    )
    .await??;

    assert_eq!(outcome, WatchOutcome::StateChanged(ConnectivityState::Ready));
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use tether::channel::{Channel, ChannelError};
use tether::completion::CompletionQueue;
use tether::engine::loopback::{CallRecord, LoopbackEngine};
use tether::engine::{Deadline, PROPAGATE_DEFAULTS, RpcEngine};

async fn setup_channel() -> (Arc<LoopbackEngine>, Channel) {
    let loopback = Arc::new(LoopbackEngine::new());
    let engine: Arc<dyn RpcEngine> = loopback.clone();
    let queue = CompletionQueue::start().await.unwrap();
    let channel = Channel::connect(engine, queue, "localhost:0", None, None).unwrap();
    (loopback, channel)
}

fn record_for<'a>(records: &'a [CallRecord], method: &str) -> &'a CallRecord {
    records
        .iter()
        .find(|r| r.method == method)
        .unwrap_or_else(|| panic!("no call record for {method}"))
}

#[tokio::test]
pub async fn call_creation_hands_everything_to_the_engine() -> anyhow::Result<()> {
    let (loopback, channel) = setup_channel().await;

    let _call = channel.create_call(
        "/echo.Echo/Ping",
        Deadline::after(Duration::from_secs(10)),
        Some("override.example"),
        None,
        Some(0x2),
    )?;

    let records = loopback.calls();
    let record = record_for(&records, "/echo.Echo/Ping");
    assert_eq!(record.host.as_deref(), Some("override.example"));
    assert_eq!(record.propagation_flags, 0x2);
    assert_eq!(record.parent, None);
    assert!(!record.released);

    Ok(())
}

#[tokio::test]
pub async fn omitted_arguments_use_the_defaults() -> anyhow::Result<()> {
    let (loopback, channel) = setup_channel().await;

    let _call = channel.create_call(
        "/echo.Echo/Ping",
        Deadline::Infinite,
        None,
        None,
        None,
    )?;

    let records = loopback.calls();
    let record = record_for(&records, "/echo.Echo/Ping");
    assert_eq!(record.host, None);
    assert_eq!(record.propagation_flags, PROPAGATE_DEFAULTS);

    Ok(())
}

#[tokio::test]
pub async fn parent_linkage_is_recorded_at_creation() -> anyhow::Result<()> {
    let (loopback, channel) = setup_channel().await;

    let parent = channel.create_call(
        "/echo.Echo/Parent",
        Deadline::Infinite,
        None,
        None,
        None,
    )?;
    let _child = channel.create_call(
        "/echo.Echo/Child",
        Deadline::Infinite,
        None,
        Some(&parent),
        None,
    )?;

    let records = loopback.calls();
    let parent_record = record_for(&records, "/echo.Echo/Parent");
    let child_record = record_for(&records, "/echo.Echo/Child");
    assert_eq!(child_record.parent, Some(parent_record.handle));

    Ok(())
}

#[tokio::test]
pub async fn calls_outlive_their_channel() -> anyhow::Result<()> {
    let (loopback, channel) = setup_channel().await;

    let call = channel.create_call(
        "/echo.Echo/Ping",
        Deadline::Infinite,
        None,
        None,
        None,
    )?;

    channel.close();

    // the call's handle is its own; the channel going away changes nothing
    let records = loopback.calls();
    assert!(!record_for(&records, "/echo.Echo/Ping").released);

    drop(call);
    let records = loopback.calls();
    assert!(record_for(&records, "/echo.Echo/Ping").released);

    Ok(())
}

#[tokio::test]
pub async fn closed_channels_spawn_no_calls() -> anyhow::Result<()> {
    let (loopback, channel) = setup_channel().await;
    channel.close();

    let err = channel
        .create_call("/echo.Echo/Ping", Deadline::Infinite, None, None, None)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChannelError>(),
        Some(ChannelError::AlreadyClosed("createCall"))
    ));
    assert!(loopback.calls().is_empty());

    Ok(())
}

#[tokio::test]
pub async fn nan_deadline_is_a_type_mismatch() -> anyhow::Result<()> {
    let (loopback, channel) = setup_channel().await;

    let err = channel
        .create_call(
            "/echo.Echo/Ping",
            Deadline::EpochMillis(f64::NAN),
            None,
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChannelError>(),
        Some(ChannelError::TypeMismatch(_))
    ));
    assert!(loopback.calls().is_empty());

    Ok(())
}

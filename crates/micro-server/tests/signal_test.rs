//! Signal-driven shutdown. Kept in its own binary since handlers are
//! process wide.

#![cfg(unix)]

use micro_server::{Service, ServiceState, ShutdownSignal};
use nix::sys::signal::{Signal, raise};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn service_watching(signal: ShutdownSignal) -> Service {
    Service::builder()
        .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .pre_shutdown_delay(Duration::ZERO)
        .signals([signal])
        .build()
}

#[tokio::test]
async fn test_only_the_watching_service_stops() {
    let watching = service_watching(ShutdownSignal::User1);
    let other = service_watching(ShutdownSignal::User2);

    let runner = watching.clone();
    let watching_handle = tokio::spawn(async move { runner.start(0, 0, |_, _| Ok(())).await });
    let runner = other.clone();
    let other_handle = tokio::spawn(async move { runner.start(0, 0, |_, _| Ok(())).await });

    for service in [&watching, &other] {
        tokio::time::timeout(Duration::from_secs(10), service.wait_until_running())
            .await
            .expect("service did not start")
            .expect("service failed to start");
    }

    raise(Signal::SIGUSR1).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), watching_handle)
        .await
        .expect("start did not return after SIGUSR1")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(watching.state(), ServiceState::Stopped);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(other.state(), ServiceState::Running);
    assert!(!other_handle.is_finished());

    other.interrupt();
    let result = tokio::time::timeout(Duration::from_secs(10), other_handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

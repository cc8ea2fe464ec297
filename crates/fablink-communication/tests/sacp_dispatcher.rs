use fablink_communication::sacp::{CommandId, Dispatcher, PacketLink, PeerId};
use fablink_core::{ChannelError, Error};
use std::time::Duration;

const SLOW: CommandId = CommandId::new(0x01, 0x21);
const FAST: CommandId = CommandId::new(0x01, 0x30);

#[tokio::test]
async fn test_acks_matched_by_sequence_not_arrival() {
    let (local, mut remote) = PacketLink::pair();
    let dispatcher = Dispatcher::new(local, Duration::from_secs(5));

    let machine = tokio::spawn(async move {
        let a = remote.inbound.recv().await.unwrap();
        let b = remote.inbound.recv().await.unwrap();
        assert_eq!(a.command, SLOW);
        assert_eq!(b.command, FAST);
        // B answers first
        remote.outbound.send(b.ack(vec![0, 0xBB])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.outbound.send(a.ack(vec![0, 0xAA])).await.unwrap();
    });

    let slow = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send(SLOW, PeerId::Controller, vec![]).await })
    };
    while dispatcher.pending_count() == 0 {
        tokio::task::yield_now().await;
    }
    let fast = dispatcher.send(FAST, PeerId::Controller, vec![]).await.unwrap();
    assert_eq!(fast.data, vec![0xBB]);

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.data, vec![0xAA]);
    machine.await.unwrap();
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_settles_once_and_late_ack_is_dropped() {
    let (local, mut remote) = PacketLink::pair();
    let dispatcher = Dispatcher::new(local, Duration::from_millis(5000));

    let late = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send(SLOW, PeerId::Controller, vec![]).await })
    };
    let request = remote.inbound.recv().await.unwrap();

    let err = late.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(dispatcher.pending_count(), 0);

    // The straggler finds nothing to resolve.
    remote
        .outbound
        .send(request.ack(vec![0, 1]))
        .await
        .unwrap();
    tokio::task::yield_now().await;
    assert_eq!(dispatcher.pending_count(), 0);

    // The dispatcher keeps working afterwards.
    let next = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send(FAST, PeerId::Controller, vec![]).await })
    };
    let request = remote.inbound.recv().await.unwrap();
    remote.outbound.send(request.ack(vec![0, 7])).await.unwrap();
    assert_eq!(next.await.unwrap().unwrap().data, vec![7]);
}

#[tokio::test]
async fn test_nonzero_result_surfaces_as_protocol_error() {
    let (local, mut remote) = PacketLink::pair();
    let dispatcher = Dispatcher::new(local, Duration::from_secs(5));
    tokio::spawn(async move {
        let request = remote.inbound.recv().await.unwrap();
        remote.outbound.send(request.ack(vec![3])).await.unwrap();
    });

    let err = dispatcher.call(FAST, vec![]).await.unwrap_err();
    assert!(err.is_protocol_error());
}

#[tokio::test]
async fn test_closed_transport_fails_requests() {
    let (local, remote) = PacketLink::pair();
    let dispatcher = Dispatcher::new(local, Duration::from_secs(5));
    drop(remote);
    dispatcher.transport_closed().cancelled().await;

    let err = dispatcher.send(FAST, PeerId::Controller, vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Channel(ChannelError::Closed)));
}

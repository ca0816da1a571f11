//! Idle timeout supervision timing.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use common::{
    connect_client, host_loop, loopback_stack, start_echo_server, start_recording_server, Recorder, LIMIT,
};
use tcpip_bridge::net::TimerState;
use tcpip_bridge::{HostLoop, Socket};

async fn connected(port: u16) -> (HostLoop, Socket, Recorder) {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    start_echo_server(&mut rt, stack, port).await;
    let (client, recorder) = connect_client(&mut rt, stack, port).await;
    (rt, client, recorder)
}

#[tokio::test]
async fn fires_once_without_activity() {
    let (mut rt, client, recorder) = connected(7100).await;

    recorder.restart_clock();
    client.set_timeout(rt.host(), 100).unwrap();
    assert_eq!(client.timer_state(rt.host()).unwrap(), TimerState::Armed);
    rt.run_for(Duration::from_millis(150)).await;

    assert_eq!(recorder.count("timeout"), 1);
    assert!(recorder.first_at("timeout").unwrap() >= Duration::from_millis(100));
    assert_eq!(recorder.count("close"), 0);
    assert_eq!(client.timer_state(rt.host()).unwrap(), TimerState::Disarmed);
    assert_eq!(client.timeout(rt.host()).unwrap(), Duration::from_millis(100));
}

#[tokio::test]
async fn zero_cancels_a_pending_timeout() {
    let (mut rt, client, recorder) = connected(7101).await;

    client.set_timeout(rt.host(), 100).unwrap();
    rt.run_for(Duration::from_millis(50)).await;
    client.set_timeout(rt.host(), 0).unwrap();
    rt.run_for(Duration::from_millis(150)).await;

    assert_eq!(recorder.count("timeout"), 0);
    assert_eq!(client.timer_state(rt.host()).unwrap(), TimerState::Disarmed);
}

#[tokio::test]
async fn activity_postpones_the_timeout() {
    let (mut rt, client, recorder) = connected(7102).await;

    recorder.restart_clock();
    client.set_timeout(rt.host(), 100).unwrap();
    rt.run_for(Duration::from_millis(60)).await;
    let written = client.write(rt.host(), Bytes::from_static(b"keepalive")).unwrap();
    rt.drive(written.wait(), LIMIT).await.unwrap();
    rt.run_for(Duration::from_millis(80)).await;
    assert_eq!(recorder.count("timeout"), 0);

    let fired = {
        let recorder = recorder.clone();
        rt.run_until(LIMIT, move |_| recorder.count("timeout") == 1).await
    };
    assert!(fired);
    assert!(recorder.first_at("timeout").unwrap() >= Duration::from_millis(160));
}

#[tokio::test]
async fn replacing_the_value_retires_the_old_supervisor() {
    let (mut rt, client, recorder) = connected(7103).await;

    recorder.restart_clock();
    client.set_timeout(rt.host(), 50).unwrap();
    let second = client.set_timeout(rt.host(), 200).unwrap();
    rt.run_for(Duration::from_millis(120)).await;
    assert_eq!(recorder.count("timeout"), 0);

    rt.drive(second.wait(), LIMIT).await.unwrap();
    rt.run_for(Duration::from_millis(50)).await;
    assert_eq!(recorder.count("timeout"), 1);
    assert!(recorder.first_at("timeout").unwrap() >= Duration::from_millis(200));
}

#[tokio::test]
async fn callback_runs_as_a_timeout_listener() {
    let (mut rt, client, _recorder) = connected(7104).await;

    let hits = Rc::new(RefCell::new(0));
    {
        let hits = Rc::clone(&hits);
        client
            .set_timeout_then(rt.host(), 30, move |_| *hits.borrow_mut() += 1)
            .unwrap();
    }
    let flag = Rc::clone(&hits);
    assert!(rt.run_until(LIMIT, move |_| *flag.borrow() == 1).await);
    rt.run_for(Duration::from_millis(60)).await;
    assert_eq!(*hits.borrow(), 1);
}

#[tokio::test]
async fn close_stops_supervision() {
    let (mut rt, client, recorder) = connected(7105).await;

    let armed = client.set_timeout(rt.host(), 50).unwrap();
    client.close(rt.host()).unwrap();
    rt.drive(armed.wait(), LIMIT).await.unwrap();
    rt.run_for(Duration::from_millis(100)).await;

    assert_eq!(recorder.count("timeout"), 0);
    assert_eq!(recorder.count("close"), 1);
}

#[tokio::test]
async fn cancelled_callback_never_runs() {
    let (mut rt, client, recorder) = connected(7106).await;

    let hits = Rc::new(RefCell::new(0));
    {
        let hits = Rc::clone(&hits);
        client
            .set_timeout_then(rt.host(), 100, move |_| *hits.borrow_mut() += 1)
            .unwrap();
    }
    rt.run_for(Duration::from_millis(30)).await;
    client.set_timeout(rt.host(), 0).unwrap();
    rt.run_for(Duration::from_millis(30)).await;
    client.set_timeout(rt.host(), 50).unwrap();
    rt.run_for(Duration::from_millis(150)).await;

    assert_eq!(recorder.count("timeout"), 1);
    assert_eq!(*hits.borrow(), 0);
}

#[tokio::test]
async fn replaced_callback_gives_way_to_the_new_one() {
    let (mut rt, client, recorder) = connected(7107).await;

    let hits = Rc::new(RefCell::new(Vec::new()));
    for (millis, tag) in [(100, "first"), (40, "second")] {
        let hits = Rc::clone(&hits);
        client
            .set_timeout_then(rt.host(), millis, move |_| hits.borrow_mut().push(tag))
            .unwrap();
    }
    {
        let recorder = recorder.clone();
        assert!(rt.run_until(LIMIT, move |_| recorder.count("timeout") == 1).await);
    }
    rt.run_for(Duration::from_millis(150)).await;

    assert_eq!(*hits.borrow(), vec!["second"]);
    assert_eq!(recorder.count("timeout"), 1);
}

#[tokio::test]
async fn inbound_data_postpones_the_timeout() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let (_server, accepted) = start_recording_server(&mut rt, stack, 7108).await;
    let (client, recorder) = connect_client(&mut rt, stack, 7108).await;
    {
        let accepted = accepted.clone();
        assert!(rt.run_until(LIMIT, move |_| accepted.sockets().len() == 1).await);
    }
    let peer = accepted.sockets()[0];

    recorder.restart_clock();
    client.set_timeout(rt.host(), 100).unwrap();
    client.read(rt.host(), 64).unwrap();
    rt.run_for(Duration::from_millis(60)).await;
    peer.write(rt.host(), Bytes::from_static(b"tick")).unwrap();
    rt.run_for(Duration::from_millis(80)).await;
    assert_eq!(recorder.data(), b"tick");
    assert_eq!(recorder.count("timeout"), 0);

    let fired = {
        let recorder = recorder.clone();
        rt.run_until(LIMIT, move |_| recorder.count("timeout") == 1).await
    };
    assert!(fired);
    assert!(recorder.first_at("timeout").unwrap() >= Duration::from_millis(160));
}

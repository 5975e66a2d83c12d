//! Dispatch and routing across scenes sharing one network.

mod common;

use std::time::Duration;

use common::*;
use scenenet::addressable::{AddressableClient, AddressableDirectory, AddressableService};
use scenenet::error::CallError;
use scenenet::messaging::{ErrorCode, Frame, OpCode, RouteId, SceneId};
use scenenet::transport::Transport;
use scenenet::RuntimeConfig;

#[test]
fn test_route_request_reaches_registered_entity() {
    init_tracing();
    let mut cluster = Cluster::new(&[1, 2], RuntimeConfig::default());
    let host = cluster.scene(1);
    install_greeter(&host);
    AddressableService::install(&host).expect("service installs");
    let route = host.add_entity(Greeter::new("hello"));

    // Scene 1 registers logical id 1001 at the greeter's route; scene 2
    // resolves it and calls the entity.
    let caller = cluster.scene(2);
    let client = AddressableClient::new(&caller, vec![SceneId(1)]);
    let reply = cluster.block_on(2, async move {
        client.register(1001, route).await?;
        let resolved = client.lookup(1001).await?;
        let reply = caller.call(resolved, &Greet { name: "bob".into() }).await?;
        Ok::<_, scenenet::AddressableError>((resolved, reply))
    });

    let (resolved, reply) = reply.expect("call succeeds");
    assert_eq!(resolved, route);
    assert_eq!(reply.error, ErrorCode::SUCCESS);
    assert_eq!(reply.text, "hello bob");
    assert_eq!(cluster.scene(2).pending_calls(), 0);
}

#[test]
fn test_missing_entity_answers_not_found_instead_of_timing_out() {
    let mut cluster = Cluster::new(&[1, 2], RuntimeConfig::default());
    install_greeter(&cluster.scene(1));
    let caller = cluster.scene(2);

    let started = std::time::Instant::now();
    let reply = cluster.block_on(2, async move {
        caller.call(vacant_route(1), &Greet { name: "nobody".into() }).await
    });

    let reply = reply.expect("an error response, not a call failure");
    assert_eq!(reply.error, ErrorCode::ERR_NOT_FOUND_ROUTE);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_route_message_to_missing_entity_is_dropped() {
    let mut cluster = Cluster::new(&[1, 2], RuntimeConfig::default());
    let host = cluster.scene(1);
    install_greeter(&host);
    let greeter = Greeter::new("hi");
    let route = host.add_entity(greeter.clone());

    let caller = cluster.scene(2);
    caller.send(vacant_route(1), &Poke).expect("send accepted");
    caller.send(route, &Poke).expect("send accepted");
    for _ in 0..3 {
        cluster.cycle();
    }
    assert_eq!(greeter.pokes.get(), 1);
}

#[test]
fn test_scene_requests_and_handler_errors() {
    let mut cluster = Cluster::new(&[1, 2], RuntimeConfig::default());
    install_ping(&cluster.scene(1));
    let caller = cluster.scene(2);

    let results = cluster.block_on(2, async move {
        let to = RouteId::for_scene(SceneId(1));
        let ok = caller.call(to, &Ping { value: 41 }).await;
        let failed = caller.call(to, &Ping { value: 0 }).await;
        let orphan = caller.call(to, &Orphan).await;
        (ok, failed, orphan)
    });

    let (ok, failed, orphan) = results;
    assert_eq!(ok.expect("ping answered").value, 42);
    assert_eq!(
        failed.expect("error response").error,
        ErrorCode::ERR_HANDLER_FAILED
    );
    assert_eq!(orphan.expect("error response").error, ErrorCode::ERR_NO_HANDLER);
}

#[test]
fn test_panicking_handler_answers_failure_and_scene_keeps_serving() {
    let mut cluster = Cluster::new(&[1, 2], RuntimeConfig::default());
    install_volatile_ping(&cluster.scene(1));
    cluster
        .network
        .post(SceneId(1), Box::new(|_| panic!("posted work blew up")))
        .expect("work posted");
    cluster.cycle();

    let caller = cluster.scene(2);
    let results = cluster.block_on(2, async move {
        let to = RouteId::for_scene(SceneId(1));
        let panicked = caller.call(to, &Ping { value: 0 }).await;
        let after = caller.call(to, &Ping { value: 9 }).await;
        (panicked, after)
    });

    let (panicked, after) = results;
    assert_eq!(
        panicked.expect("error response").error,
        ErrorCode::ERR_HANDLER_FAILED
    );
    assert_eq!(after.expect("ping answered").value, 9);
    assert!(cluster.network.contains(SceneId(1)));
}

#[test]
fn test_wrong_entity_type_is_reported() {
    let mut cluster = Cluster::new(&[1, 2], RuntimeConfig::default());
    let host = cluster.scene(1);
    install_greeter(&host);
    let route = host.add_entity(std::rc::Rc::new(String::from("not a greeter")));

    let caller = cluster.scene(2);
    let reply = cluster.block_on(2, async move {
        caller.call(route, &Greet { name: "x".into() }).await
    });
    assert_eq!(
        reply.expect("error response").error,
        ErrorCode::ERR_ENTITY_TYPE_MISMATCH
    );
}

#[test]
fn test_relay_forwards_requests_and_messages() {
    let mut cluster = Cluster::new(&[1, 2, 3], RuntimeConfig::default());
    let host = cluster.scene(1);
    install_greeter(&host);
    let greeter = Greeter::new("via relay");
    let target = host.add_entity(greeter.clone());
    let relay = cluster.scene(3).add_relay(target);
    let dangling = cluster.scene(3).add_relay(vacant_route(1));

    let caller = cluster.scene(2);
    caller.send(relay, &Poke).expect("send accepted");
    let replies = cluster.block_on(2, async move {
        let forwarded = caller.call(relay, &Greet { name: "carol".into() }).await;
        let missing = caller.call(dangling, &Greet { name: "dave".into() }).await;
        (forwarded, missing)
    });

    let (forwarded, missing) = replies;
    assert_eq!(forwarded.expect("relayed reply").text, "via relay carol");
    assert_eq!(
        missing.expect("relayed error").error,
        ErrorCode::ERR_NOT_FOUND_ROUTE
    );
    assert_eq!(greeter.pokes.get(), 1);
}

#[test]
fn test_unsupported_frames_do_not_stop_the_scene() {
    init_tracing();
    let mut cluster = Cluster::new(&[1, 2], RuntimeConfig::default());
    install_ping(&cluster.scene(1));

    for raw in [0x0000_0001, 0x07ff_ffff, 0x5000_0000, 0x0800_7777] {
        let frame = Frame {
            opcode: OpCode::from_raw(raw),
            rpc_id: 9,
            route_id: RouteId::for_scene(SceneId(1)),
            payload: vec![0xde, 0xad],
        };
        cluster
            .network
            .send(SceneId(2), SceneId(1), frame)
            .expect("frame queued");
    }
    // Registered opcode with a garbage payload.
    let garbage = Frame {
        opcode: <Ping as scenenet::messaging::Message>::OPCODE,
        rpc_id: 0,
        route_id: RouteId::for_scene(SceneId(1)),
        payload: b"{not json".to_vec(),
    };
    cluster
        .network
        .send(SceneId(2), SceneId(1), garbage)
        .expect("frame queued");

    let caller = cluster.scene(2);
    let reply = cluster.block_on(2, async move {
        caller.call(RouteId::for_scene(SceneId(1)), &Ping { value: 1 }).await
    });
    assert_eq!(reply.expect("scene still answers").value, 2);
}

#[test]
fn test_unanswered_call_times_out() {
    let config = RuntimeConfig::builder()
        .rpc_timeout(Duration::from_millis(20))
        .pending_sweep_interval(Duration::from_millis(5))
        .build()
        .expect("valid config");
    let mut cluster = Cluster::new(&[1, 2], config);
    cluster
        .scene(1)
        .register_request::<Ping, _, _>(|scene, _| async move {
            scene.delay(Duration::from_secs(60)).await.ok();
            Ok(Pong::default())
        })
        .expect("handler registers");

    let caller = cluster.scene(2);
    let result = cluster.block_on(2, async move {
        caller.call(RouteId::for_scene(SceneId(1)), &Ping { value: 1 }).await
    });
    assert!(matches!(result, Err(CallError::Timeout)));
    assert_eq!(cluster.scene(2).pending_calls(), 0);
}

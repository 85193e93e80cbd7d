use std::{
    cell::RefCell,
    rc::Rc,
    sync::Once,
    thread,
    time::{Duration, Instant},
};

use weft::{
    BodyFlag, LinkFactory, LinkId, LinkRecipe, LinkType, MsgProtocol, NetConfig, NetMsg,
    NetThread, RouteFlag, SUCCESS,
};

const MSG_LINK: LinkType = 1;

fn register_links() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        LinkFactory::register(
            MSG_LINK,
            LinkRecipe {
                name: "tcp-msg",
                build_stack: |stack| {
                    stack.push_protocol(Box::new(MsgProtocol::new())).unwrap();
                },
            },
        );
    });
}

/// Pumps the logic side of both facades until `done` answers true.
fn pump(threads: &mut [&mut NetThread], mut done: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let start = Instant::now();
    loop {
        if done() {
            return true;
        }
        if start.elapsed() > Duration::from_millis(timeout_ms) {
            return false;
        }
        for t in threads.iter_mut() {
            t.update();
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn request_reply_and_message_roundtrip() {
    register_links();

    let mut server = NetThread::new(NetConfig::default());
    let mut client = NetThread::new(NetConfig::default());
    server.start().unwrap();
    client.start().unwrap();

    let listened: Rc<RefCell<Option<i32>>> = Rc::new(RefCell::new(None));
    {
        let listened = listened.clone();
        server.listen_tcp(MSG_LINK, 1, "127.0.0.1", 18140, move |err, group_id| {
            assert_eq!(group_id, 1);
            listened.borrow_mut().replace(err);
        });
    }
    assert!(pump(&mut [&mut server, &mut client], || listened.borrow().is_some(), 3_000));
    assert_eq!(listened.borrow().unwrap(), SUCCESS);

    let server_msgs: Rc<RefCell<Vec<(LinkId, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let msgs = server_msgs.clone();
        server.event_link_msg.bind(move |args| {
            if let Some(msg) = args.msg.take() {
                msgs.borrow_mut().push((args.link_id, msg.body().to_vec()));
            }
            true
        });
    }
    let client_msgs: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let msgs = client_msgs.clone();
        client.event_link_msg.bind(move |args| {
            if let Some(msg) = args.msg.take() {
                msgs.borrow_mut().push(msg.body().to_vec());
            }
            true
        });
    }

    let connected: Rc<RefCell<Option<LinkId>>> = Rc::new(RefCell::new(None));
    {
        let connected = connected.clone();
        client.connect_tcp(MSG_LINK, 2, "127.0.0.1", 18140, move |err, _, link_id| {
            assert_eq!(err, SUCCESS);
            connected.borrow_mut().replace(link_id);
        });
    }
    assert!(pump(&mut [&mut server, &mut client], || connected.borrow().is_some(), 3_000));

    let mut msg = NetMsg::obtain();
    msg.set_body_flag(BodyFlag::Msg);
    msg.set_route_flag(RouteFlag::NoPack);
    msg.write_body(b"over the wall");
    msg.set_link_id(connected.borrow().unwrap());
    client.send_msg(msg);

    assert!(pump(&mut [&mut server, &mut client], || !server_msgs.borrow().is_empty(), 3_000));
    assert_eq!(server_msgs.borrow()[0].1, b"over the wall");

    // Reply using the server-side link id delivered with the message.
    let server_side_link = server_msgs.borrow()[0].0;
    let mut reply = NetMsg::obtain();
    reply.set_body_flag(BodyFlag::Msg);
    reply.set_route_flag(RouteFlag::NoPack);
    reply.write_body(b"and back");
    reply.set_link_id(server_side_link);
    server.send_msg(reply);

    assert!(pump(&mut [&mut server, &mut client], || !client_msgs.borrow().is_empty(), 3_000));
    assert_eq!(client_msgs.borrow()[0], b"and back");

    client.close_link(connected.borrow().unwrap(), SUCCESS);
    server.stop();
    client.stop();
    assert!(!server.is_running());
}

#[test]
fn get_host_ip_resolves() {
    register_links();

    let mut net = NetThread::new(NetConfig::default());
    net.start().unwrap();

    let answer: Rc<RefCell<Option<(i32, String)>>> = Rc::new(RefCell::new(None));
    {
        let answer = answer.clone();
        net.get_host_ip("localhost", move |err, ip| {
            answer.borrow_mut().replace((err, ip));
        });
    }
    assert!(pump(&mut [&mut net], || answer.borrow().is_some(), 5_000));
    let (err, ip) = answer.borrow().clone().unwrap();
    assert_eq!(err, SUCCESS);
    assert!(ip.parse::<std::net::IpAddr>().is_ok());

    net.stop();
}

#[test]
fn expired_request_drops_continuation_and_discards_late_reply() {
    register_links();

    let config = NetConfig { req_timeout_ms: 100, ..NetConfig::default() };
    let mut net = NetThread::new(config);

    // The request is queued while the worker is not yet running, so no
    // reply can arrive before the deadline passes.
    let fired: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
    {
        let fired = fired.clone();
        net.get_host_ip("localhost", move |_, _| {
            *fired.borrow_mut() = true;
        });
    }
    thread::sleep(Duration::from_millis(250));
    net.update();
    assert!(!*fired.borrow(), "expired continuation must not run");

    // Now let the worker catch up on the stale request.
    net.start().unwrap();

    // The worker eventually resolves the stale request; the late reply is
    // discarded without invoking anything.
    let deadline = Instant::now() + Duration::from_millis(2_000);
    while Instant::now() < deadline {
        net.update();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!*fired.borrow(), "late reply must be discarded");

    net.stop();
}

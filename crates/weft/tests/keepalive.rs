use std::{
    cell::RefCell,
    rc::Rc,
    sync::Once,
    thread,
    time::{Duration, Instant},
};

use weft::{
    LinkFactory, LinkId, LinkRecipe, LinkType, MsgProtocol, NetConfig, NetError, NetProcess,
    SUCCESS,
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

fn pump(procs: &mut [&mut NetProcess], mut done: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let start = Instant::now();
    let mut last = Instant::now();
    loop {
        if done() {
            return true;
        }
        if start.elapsed() > Duration::from_millis(timeout_ms) {
            return false;
        }
        let delta = (last.elapsed().as_millis() as i64).max(1);
        last = Instant::now();
        for p in procs.iter_mut() {
            p.update(delta);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn silent_link_closes_with_keepalive_timeout() {
    register_links();

    let server_config = NetConfig { keepalive_ms: 200, ..NetConfig::default() };
    let mut server = NetProcess::start(server_config).unwrap();
    let mut client = NetProcess::start(NetConfig::default()).unwrap();
    server.listen_tcp(MSG_LINK, 1, "127.0.0.1", 18110).unwrap();

    let closed: Rc<RefCell<Option<i32>>> = Rc::new(RefCell::new(None));
    {
        let closed = closed.clone();
        server.event_link_close().bind(move |args| {
            closed.borrow_mut().replace(args.reason);
            true
        });
    }

    let connected: Rc<RefCell<Option<LinkId>>> = Rc::new(RefCell::new(None));
    {
        let connected = connected.clone();
        client.connect_tcp(MSG_LINK, 2, "127.0.0.1", 18110, move |err, _, link_id| {
            assert_eq!(err, SUCCESS);
            connected.borrow_mut().replace(link_id);
        });
    }
    assert!(pump(&mut [&mut server, &mut client], || connected.borrow().is_some(), 3_000));

    // The client stays silent; within half a second the server declares the
    // link dead.
    assert!(pump(&mut [&mut server, &mut client], || closed.borrow().is_some(), 2_000));
    assert_eq!(closed.borrow().unwrap(), NetError::KeepAliveTimeout.code());

    server.stop();
    client.stop();
}

#[test]
fn active_link_survives_keepalive() {
    register_links();

    let server_config = NetConfig { keepalive_ms: 200, ..NetConfig::default() };
    let mut server = NetProcess::start(server_config).unwrap();
    let mut client = NetProcess::start(NetConfig::default()).unwrap();
    server.listen_tcp(MSG_LINK, 1, "127.0.0.1", 18111).unwrap();

    let closed: Rc<RefCell<Option<i32>>> = Rc::new(RefCell::new(None));
    {
        let closed = closed.clone();
        server.event_link_close().bind(move |args| {
            closed.borrow_mut().replace(args.reason);
            true
        });
    }

    let connected: Rc<RefCell<Option<LinkId>>> = Rc::new(RefCell::new(None));
    {
        let connected = connected.clone();
        client.connect_tcp(MSG_LINK, 2, "127.0.0.1", 18111, move |err, _, link_id| {
            assert_eq!(err, SUCCESS);
            connected.borrow_mut().replace(link_id);
        });
    }
    assert!(pump(&mut [&mut server, &mut client], || connected.borrow().is_some(), 3_000));

    // Chatter more often than the threshold for ~600 ms.
    let deadline = Instant::now() + Duration::from_millis(600);
    while Instant::now() < deadline {
        let mut msg = weft::NetMsg::obtain();
        msg.set_body_flag(weft::BodyFlag::Msg);
        msg.set_route_flag(weft::RouteFlag::NoPack);
        msg.write_body(b"ping");
        msg.set_link_id(connected.borrow().unwrap());
        client.send_msg(msg).unwrap();
        pump(&mut [&mut server, &mut client], || false, 80);
    }

    assert!(closed.borrow().is_none(), "live link was closed: {:?}", closed.borrow());

    server.stop();
    client.stop();
}

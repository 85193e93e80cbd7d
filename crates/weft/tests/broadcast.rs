use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
    sync::Once,
    thread,
    time::{Duration, Instant},
};

use weft::{
    BodyFlag, BroadcastDest, LinkFactory, LinkId, LinkRecipe, LinkType, MsgProtocol, NetConfig,
    NetMsg, NetProcess, RouteFlag, SUCCESS, UserId,
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

fn send_intro(client: &mut NetProcess, link_id: LinkId, tag: &[u8]) {
    let mut msg = NetMsg::obtain();
    msg.set_body_flag(BodyFlag::Msg);
    msg.set_route_flag(RouteFlag::NoPack);
    msg.write_body(tag);
    msg.set_link_id(link_id);
    client.send_msg(msg).unwrap();
}

#[test]
fn broadcast_fans_out_per_link_and_user() {
    register_links();

    let mut server = NetProcess::start(NetConfig::default()).unwrap();
    let mut client = NetProcess::start(NetConfig::default()).unwrap();
    server.listen_tcp(MSG_LINK, 1, "127.0.0.1", 18130).unwrap();

    // Server maps intro bodies to its own link ids.
    let intros: Rc<RefCell<HashMap<Vec<u8>, LinkId>>> = Rc::new(RefCell::new(HashMap::new()));
    {
        let intros = intros.clone();
        server.event_link_msg().bind(move |args| {
            if let Some(msg) = args.msg.take() {
                intros.borrow_mut().insert(msg.body().to_vec(), args.link_id);
            }
            true
        });
    }

    // Client records fan-out copies per client-side link.
    let received: Rc<RefCell<Vec<(LinkId, UserId, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        client.event_link_msg().bind(move |args| {
            if let Some(msg) = args.msg.take() {
                received.borrow_mut().push((args.link_id, msg.user_id(), msg.body().to_vec()));
            }
            true
        });
    }

    let ids: Rc<RefCell<Vec<LinkId>>> = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..2 {
        let ids = ids.clone();
        client.connect_tcp(MSG_LINK, 2, "127.0.0.1", 18130, move |err, _, link_id| {
            assert_eq!(err, SUCCESS);
            ids.borrow_mut().push(link_id);
        });
    }
    assert!(pump(&mut [&mut server, &mut client], || ids.borrow().len() == 2, 3_000));
    let client_one = ids.borrow()[0];
    let client_two = ids.borrow()[1];

    send_intro(&mut client, client_one, b"one");
    send_intro(&mut client, client_two, b"two");
    assert!(pump(&mut [&mut server, &mut client], || intros.borrow().len() == 2, 3_000));
    let l1 = intros.borrow()[b"one".as_slice()];
    let l2 = intros.borrow()[b"two".as_slice()];

    // Three (link, user) pairs; the route record must carry each pair.
    let mut dest = BroadcastDest::new();
    dest.insert(l1, HashSet::from([7, 9]));
    dest.insert(l2, HashSet::from([11]));

    let mut msg = NetMsg::obtain();
    msg.set_body_flag(BodyFlag::Msg);
    msg.set_route_flag(RouteFlag::Pack);
    msg.write_body(b"fanout");
    server.broadcast_msg(&dest, msg).unwrap();

    assert!(pump(&mut [&mut server, &mut client], || received.borrow().len() == 3, 3_000));

    let received = received.borrow();
    let mut by_link: HashMap<LinkId, HashSet<UserId>> = HashMap::new();
    for (link_id, user_id, body) in received.iter() {
        assert_eq!(body, b"fanout");
        by_link.entry(*link_id).or_default().insert(*user_id);
    }
    assert_eq!(by_link[&client_one], HashSet::from([7, 9]));
    assert_eq!(by_link[&client_two], HashSet::from([11]));

    server.stop();
    client.stop();
}

use std::{
    fs::OpenOptions,
    io::{Read, Write},
    time::{Duration, Instant},
};

use consoled::{
    DomId,
    config::Config,
    event_loop::Daemon,
    ring::{Drained, RingLayout},
    session::Session,
    signals::Signals,
    testing::{TestHost, publish_console},
};

const POLL_CAP: Option<Duration> = Some(Duration::from_millis(20));

fn small_ring_config() -> Config {
    Config {
        ring_layout: RingLayout::new(1024, 1024).unwrap(),
        ..Config::default()
    }
}

#[test]
fn drain_copies_everything_and_notifies_once() -> color_eyre::Result<()> {
    let mut t = TestHost::new(small_ring_config());
    t.hv.add_domain(DomId(1));
    publish_console(&t.store, DomId(1), 10, 3);
    let mut session = Session::create(DomId(1), &mut t.host, Instant::now())?;

    let guest = t.guest_ring(DomId(1), 10)?;
    let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(guest.guest().write(&payload), 600);
    let bell = t.evtchn.latest(DomId(1)).expect("doorbell bound");
    bell.kick();

    session.handle_ring_read();

    assert_eq!(session.buffer().as_bytes(), &payload[..]);
    assert_eq!(guest.out_indices(), (600, 600));
    assert_eq!(bell.notify_count(), 1);
    assert_eq!(bell.unmask_count(), 1);
    Ok(())
}

#[test]
fn out_of_range_indices_are_not_trusted() -> color_eyre::Result<()> {
    let mut t = TestHost::new(small_ring_config());
    t.hv.add_domain(DomId(1));
    publish_console(&t.store, DomId(1), 10, 3);
    let mut session = Session::create(DomId(1), &mut t.host, Instant::now())?;

    let guest = t.guest_ring(DomId(1), 10)?;
    guest.guest().set_out_indices(2000, 0);

    assert_eq!(session.drain(), Drained::Invalid { prod: 2000, cons: 0 });
    assert_eq!(guest.out_indices(), (2000, 0));
    assert!(session.buffer().is_empty());
    let bell = t.evtchn.latest(DomId(1)).unwrap();
    assert_eq!(bell.notify_count(), 0);
    Ok(())
}

#[test]
fn wrapped_indices_drain_in_order() -> color_eyre::Result<()> {
    let mut t = TestHost::new(small_ring_config());
    t.hv.add_domain(DomId(1));
    publish_console(&t.store, DomId(1), 10, 3);
    let mut session = Session::create(DomId(1), &mut t.host, Instant::now())?;

    let guest = t.guest_ring(DomId(1), 10)?;
    let start = u32::MAX - 9;
    guest.guest().set_out_indices(start, start);
    guest.guest().write(b"across the wrap point");

    assert_eq!(session.drain(), Drained::Bytes(21));
    assert_eq!(session.buffer().as_bytes(), b"across the wrap point");
    let end = start.wrapping_add(21);
    assert_eq!(guest.out_indices(), (end, end));
    Ok(())
}

#[test]
fn pty_round_trip() -> color_eyre::Result<()> {
    let TestHost {
        host,
        store,
        hv,
        evtchn,
    } = TestHost::new(Config::default());
    hv.add_domain(DomId(3));
    publish_console(&store, DomId(3), 44, 8);
    let mut daemon = Daemon::new(host)?;
    let signals = Signals::new();

    let tty_path = store
        .get("/local/domain/3/console/tty")
        .expect("tty published");
    let mut user = OpenOptions::new().read(true).write(true).open(&tty_path)?;

    let guest = hv.guest_ring(DomId(3), 44, RingLayout::XEN)?;
    guest.guest().write(b"login: ");
    evtchn.latest(DomId(3)).expect("bound").kick();

    for _ in 0..10 {
        daemon.iterate(&signals, POLL_CAP)?;
        let session = daemon.registry().lookup(DomId(3)).expect("session");
        if session.buffer().is_empty() && guest.out_indices().1 == 7 {
            break;
        }
    }
    let mut seen = [0u8; 7];
    user.read_exact(&mut seen)?;
    assert_eq!(&seen, b"login: ");

    user.write_all(b"root\n")?;
    let mut typed = Vec::new();
    for _ in 0..10 {
        daemon.iterate(&signals, POLL_CAP)?;
        typed.extend(guest.guest().read());
        if typed.len() >= 5 {
            break;
        }
    }
    assert_eq!(typed, b"root\n");
    Ok(())
}

use std::{fs, time::Duration};

use consoled::{
    DomId,
    config::Config,
    event_loop::Daemon,
    hv_log::HV_LOG_NAME,
    ring::RingLayout,
    session::Session,
    signals::Signals,
    testing::{TestHost, publish_console},
};

const POLL_CAP: Option<Duration> = Some(Duration::from_millis(20));

#[test]
fn guest_output_is_logged_and_survives_rotation() -> color_eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        log_dir: dir.path().to_path_buf(),
        log_guest: true,
        ..Config::default()
    };
    let TestHost {
        host,
        store,
        hv,
        evtchn,
    } = TestHost::new(config);
    hv.add_domain(DomId(2));
    store.set("/local/domain/2/name", "web");
    publish_console(&store, DomId(2), 5, 5);
    let mut daemon = Daemon::new(host)?;
    let signals = Signals::new();
    let guest = hv.guest_ring(DomId(2), 5, RingLayout::XEN)?;
    let bell = evtchn.latest(DomId(2)).unwrap();
    let log_path = dir.path().join("guest-web.log");

    guest.guest().write(b"kernel: booting\n");
    bell.kick();
    daemon.iterate(&signals, POLL_CAP)?;
    assert_eq!(fs::read(&log_path)?, b"kernel: booting\n");

    // logrotate moves the file away, then asks for a reload
    let rotated = dir.path().join("guest-web.log.1");
    fs::rename(&log_path, &rotated)?;
    signals.request_reload();
    daemon.iterate(&signals, POLL_CAP)?;

    guest.guest().write(b"init: ready\n");
    bell.kick();
    daemon.iterate(&signals, POLL_CAP)?;
    assert_eq!(fs::read(&rotated)?, b"kernel: booting\n");
    assert_eq!(fs::read(&log_path)?, b"init: ready\n");
    Ok(())
}

#[test]
fn log_keeps_bytes_the_buffer_drops() -> color_eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        log_dir: dir.path().to_path_buf(),
        log_guest: true,
        ..Config::default()
    };
    let mut t = TestHost::new(config);
    t.hv.add_domain(DomId(3));
    t.store.set("/local/domain/3/name", "db");
    t.store.set("/local/domain/3/console/limit", "16");
    publish_console(&t.store, DomId(3), 6, 6);
    let now = std::time::Instant::now();
    let mut session = Session::create(DomId(3), &mut t.host, now)?;
    let guest = t.guest_ring(DomId(3), 6)?;

    let line: Vec<u8> = b"0123456789abcdefghijklmnopqrstuv".to_vec();
    guest.guest().write(&line);
    session.drain();

    assert_eq!(session.buffer().size(), 16);
    assert_eq!(fs::read(dir.path().join("guest-db.log"))?, line);
    Ok(())
}

#[test]
fn hypervisor_console_is_logged() -> color_eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        log_dir: dir.path().to_path_buf(),
        log_hv: true,
        ..Config::default()
    };
    let TestHost {
        host, hv, evtchn, ..
    } = TestHost::new(config);
    let mut daemon = Daemon::new(host)?;
    let signals = Signals::new();
    assert!(daemon.hv_log().is_some());

    hv.console_write(b"(XEN) Xen version 4.19\n");
    evtchn.virq_bell().expect("virq bound").kick();
    daemon.iterate(&signals, POLL_CAP)?;

    let logged = fs::read(dir.path().join(HV_LOG_NAME))?;
    assert_eq!(logged, b"(XEN) Xen version 4.19\n");
    Ok(())
}

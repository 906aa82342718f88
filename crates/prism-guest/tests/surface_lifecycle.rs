//! Surface lifecycle against the device model: primary ordering, the pooled
//! id destroy barrier, and teardown.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use prism_guest::surface::SurfaceError;
use prism_protocol::ring::CursorKind;
use prism_protocol::surface_cmd::SurfaceFormat;

use common::setup;

#[test]
fn primary_destroy_hides_the_cursor_first() {
    let (mut session, mock) = setup();
    session
        .create_primary(SurfaceFormat::B8G8R8A8, 800, 600)
        .unwrap();
    mock.with(|m| assert_eq!(m.primary_creates, 1));

    session.destroy_primary().unwrap();
    mock.with(|m| {
        assert_eq!(m.primary_destroys, 1);
        // The hide op reached the cursor ring before the destroy doorbell.
        assert_eq!(m.consumed_cursor_ops.len(), 1);
        assert_eq!(m.consumed_cursor_ops[0].kind, CursorKind::Hide as u32);
    });
}

#[test]
fn surface_pool_exhaustion_and_reuse_through_the_barrier() {
    let (mut session, mock) = setup();
    session.attach_vram_slot().unwrap();

    // Pool of 3 off-screen ids (n_surfaces = 4).
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            session
                .allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64)
                .unwrap(),
        );
    }
    assert_eq!(ids, vec![1, 2, 3]);

    let err = session
        .allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64)
        .unwrap_err();
    assert_eq!(
        err,
        prism_guest::session::SessionError::Surface(SurfaceError::SurfaceIdPoolExhausted)
    );

    // Blocking destroy: the device acks inside the doorbell, the barrier
    // completes, and the freed id is allocated again.
    session.destroy_surface(2).unwrap();
    mock.with(|m| assert_eq!(m.surfaces_destroyed, vec![2]));
    assert_eq!(
        session.allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64),
        Ok(2)
    );
}

#[test]
fn destroy_surface_blocks_until_the_completion_signal() {
    let (mut session, mock) = setup();
    session.attach_vram_slot().unwrap();
    let id = session
        .allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64)
        .unwrap();

    // The device defers the ack; a worker signals it later.
    mock.with(|m| m.auto_ack_destroy = false);
    let acked = Arc::new(AtomicBool::new(false));
    let acked_flag = Arc::clone(&acked);
    let device = mock.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        acked_flag.store(true, Ordering::SeqCst);
        device.ack_destroy_now();
    });

    session.destroy_surface(id).unwrap();
    // destroy_surface returned, so the ack must have happened first.
    assert!(acked.load(Ordering::SeqCst));
    worker.join().unwrap();
}

#[test]
fn two_phase_destroy_keeps_the_id_reserved_between_phases() {
    let (mut session, mock) = setup();
    session.attach_vram_slot().unwrap();
    for _ in 0..3 {
        session
            .allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64)
            .unwrap();
    }
    mock.with(|m| m.auto_ack_destroy = false);

    session.begin_destroy_surface(1).unwrap();
    // Device has not acked: the id must not come back yet.
    assert!(matches!(
        session.allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64),
        Err(prism_guest::session::SessionError::Surface(
            SurfaceError::SurfaceIdPoolExhausted
        ))
    ));

    mock.ack_destroy_now();
    session.io_cmd_event().wait();
    session.complete_destroy_surface(1).unwrap();
    assert_eq!(
        session.allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64),
        Ok(1)
    );
}

#[test]
fn vram_pressure_triggers_one_reclaim_cycle() {
    let (mut session, _mock) = setup();
    session.attach_vram_slot().unwrap();

    // One 256x256x4 surface fills the whole 0x4_0000-byte VRAM aperture.
    let id = session
        .allocate_surface(SurfaceFormat::B8G8R8A8, 256, 256)
        .unwrap();

    // The next allocation cannot fit. The reclaim cycle runs, but the device
    // releases nothing, so the exhaustion surfaces.
    let err = session
        .allocate_surface(SurfaceFormat::B8G8R8A8, 256, 256)
        .unwrap_err();
    assert!(matches!(
        err,
        prism_guest::session::SessionError::Surface(SurfaceError::VramExhausted { .. })
    ));

    // After the surface is destroyed the same allocation succeeds.
    session.destroy_surface(id).unwrap();
    session
        .allocate_surface(SurfaceFormat::B8G8R8A8, 256, 256)
        .unwrap();
}

#[test]
fn teardown_destroys_surfaces_then_removes_the_vram_slot() {
    let (mut session, mock) = setup();
    let vram_id = session.attach_vram_slot().unwrap();
    session
        .create_primary(SurfaceFormat::B8G8R8A8, 800, 600)
        .unwrap();
    session
        .allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64)
        .unwrap();

    session.detach_surfaces().unwrap();
    mock.with(|m| {
        assert_eq!(m.destroy_all_count, 1);
        assert_eq!(m.slots_removed, vec![vram_id]);
        // Cursor was retracted before the surfaces went away.
        assert!(m
            .consumed_cursor_ops
            .iter()
            .any(|c| c.kind == CursorKind::Hide as u32));
    });

    // Surface support is gone until a slot is attached again.
    assert!(matches!(
        session.allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64),
        Err(prism_guest::session::SessionError::Surface(
            SurfaceError::VramSlotMissing
        ))
    ));
    session.attach_vram_slot().unwrap();
    session
        .allocate_surface(SurfaceFormat::B8G8R8A8, 64, 64)
        .unwrap();
}

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{assert_all_released, record, MockSession, Seen};
use framesink::capture::{CaptureSession, DropReason, PixelFormat, SampleTarget, SourceDescriptor};
use framesink::{DeliverySink, Error, FrameBuffer, SinkConfig, Timestamp};

#[test]
fn test_three_frames_in_order() {
    let session = MockSession::new(4);
    let sink = DeliverySink::new(SinkConfig::default());

    let timestamps = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let timestamps = timestamps.clone();
        let seen = seen.clone();
        sink.set_frame_callback(move |frame: FrameBuffer| {
            seen.lock().unwrap().push(frame.sequence());
            timestamps.lock().unwrap().push(frame.timestamp()?);
            assert_eq!(frame.pixel_format()?, PixelFormat::Nv12);
            Ok(())
        });
    }
    let drops = Arc::new(AtomicU64::new(0));
    {
        let drops = drops.clone();
        sink.set_drop_callback(move |_| {
            drops.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }

    sink.attach(&session).unwrap();
    for _ in 0..3 {
        assert!(session.frame());
    }

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    let timestamps = timestamps.lock().unwrap();
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(drops.load(Ordering::Relaxed), 0);
    assert_eq!(sink.delivery_stats().frames_delivered, 3);
    assert_all_released(session.pool());
}

#[test]
fn test_drop_between_frames() {
    let session = MockSession::new(4);
    let sink = DeliverySink::new(SinkConfig::default());
    let seen = record(&sink);

    sink.attach(&session).unwrap();
    session.frame();
    session.drop_frame(DropReason::ConsumerTooSlow);
    session.frame();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Seen::Frame(1),
            Seen::Drop(2, DropReason::ConsumerTooSlow),
            Seen::Frame(3),
        ]
    );

    let snapshot = sink.drop_snapshot();
    assert_eq!(snapshot.count(DropReason::ConsumerTooSlow), 1);
    assert_eq!(snapshot.total(), 1);
    assert_eq!(snapshot.last_drop_sequence(), Some(2));
    assert_eq!(
        snapshot.iter().collect::<Vec<_>>(),
        vec![(DropReason::ConsumerTooSlow, 1)]
    );
}

#[test]
fn test_mixed_events_number_consecutively() {
    let session = MockSession::new(2);
    let sink = DeliverySink::new(SinkConfig::default());
    let seen = record(&sink);
    sink.attach(&session).unwrap();

    // Small LCG so the event mix is varied but reproducible.
    let mut state = 0x2545_f491_u32;
    let mut expected_drops = [0u64; 4];
    for _ in 0..500 {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        match (state >> 16) % 6 {
            0 => {
                session.drop_frame(DropReason::ConsumerTooSlow);
                expected_drops[1] += 1;
            }
            1 => {
                session.drop_frame(DropReason::PipelineStopped);
                expected_drops[2] += 1;
            }
            _ => {
                session.frame();
            }
        }
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 500);
    for (i, event) in seen.iter().enumerate() {
        assert_eq!(event.sequence(), i as u64 + 1);
    }

    let snapshot = sink.drop_snapshot();
    assert_eq!(snapshot.count(DropReason::ConsumerTooSlow), expected_drops[1]);
    assert_eq!(snapshot.count(DropReason::PipelineStopped), expected_drops[2]);
    assert_eq!(snapshot.count(DropReason::BufferPoolExhausted), 0);
    assert_all_released(session.pool());
}

#[test]
fn test_attach_starts_a_fresh_session() {
    let session = MockSession::new(2);
    let sink = DeliverySink::new(SinkConfig::default());
    let seen = record(&sink);

    sink.attach(&session).unwrap();
    session.frame();
    session.drop_frame(DropReason::Unknown);
    sink.detach(&session).unwrap();
    assert!(!session.is_bound());

    // Counts survive until the next session starts.
    assert_eq!(sink.drop_snapshot().total(), 1);

    seen.lock().unwrap().clear();
    sink.attach(&session).unwrap();
    assert_eq!(sink.drop_snapshot().total(), 0);
    assert_eq!(sink.delivery_stats().frames_delivered, 0);
    session.frame();
    assert_eq!(*seen.lock().unwrap(), vec![Seen::Frame(1)]);
}

#[test]
fn test_lifecycle_misuse() {
    let session = MockSession::new(1);
    let sink = DeliverySink::new(SinkConfig::default());

    assert!(matches!(sink.detach(&session), Err(Error::NotAttached)));
    sink.attach(&session).unwrap();
    assert!(sink.is_attached());
    assert!(matches!(sink.attach(&session), Err(Error::AlreadyAttached)));
    sink.detach(&session).unwrap();
    assert!(!sink.is_attached());
}

#[test]
fn test_late_events_after_detach_are_released() {
    let session = MockSession::new(2);
    let sink = DeliverySink::new(SinkConfig::default());
    let seen = record(&sink);

    sink.attach(&session).unwrap();
    session.frame();
    sink.detach(&session).unwrap();

    // A pipeline still holding on to the old target.
    let source = session.descriptor(PixelFormat::Nv12.fourcc()).unwrap();
    sink.on_frame_available(source, Timestamp::from_nanos(1), &framesink::ConnectionInfo::new(7, "mock"));
    sink.on_frame_dropped(
        Timestamp::from_nanos(2),
        &framesink::ConnectionInfo::new(7, "mock"),
        DropReason::PipelineStopped,
    );

    assert_eq!(*seen.lock().unwrap(), vec![Seen::Frame(1)]);
    assert_eq!(sink.drop_snapshot().total(), 0);
    assert_all_released(session.pool());
}

#[test]
fn test_last_registration_wins() {
    let session = MockSession::new(2);
    let sink = DeliverySink::new(SinkConfig::default());

    let first = Arc::new(AtomicU64::new(0));
    let second = Arc::new(AtomicU64::new(0));
    {
        let first = first.clone();
        sink.set_frame_callback(move |_| {
            first.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }
    {
        let second = second.clone();
        sink.set_frame_callback(move |_| {
            second.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }

    sink.attach(&session).unwrap();
    session.frame();
    session.frame();
    assert_eq!(first.load(Ordering::Relaxed), 0);
    assert_eq!(second.load(Ordering::Relaxed), 2);

    sink.clear_frame_callback();
    session.frame();
    let stats = sink.delivery_stats();
    assert_eq!(stats.frames_delivered, 2);
    assert_eq!(stats.frames_unclaimed, 1);
    assert_all_released(session.pool());
}

#[test]
fn test_overrunning_layout_becomes_unknown_drop() {
    let session = MockSession::new(1);
    let sink = DeliverySink::new(SinkConfig::default());
    let seen = record(&sink);

    sink.attach(&session).unwrap();
    session.frame();

    // Planes for an 8x8 frame over storage sized for 4x2.
    let storage = session.pool().acquire().unwrap();
    let source = SourceDescriptor::new(
        PixelFormat::Nv12.fourcc(),
        8,
        8,
        PixelFormat::Nv12.plane_layouts(8, 8),
        storage,
    );
    sink.on_frame_available(source, session.tick(), &session.connection());
    assert_eq!(session.pool().stats().outstanding(), 0);

    session.frame();
    sink.detach(&session).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Seen::Frame(1),
            Seen::Drop(2, DropReason::Unknown),
            Seen::Frame(3),
        ]
    );
    assert_eq!(sink.drop_snapshot().count(DropReason::Unknown), 1);
    assert_eq!(sink.drop_snapshot().last_drop_sequence(), Some(2));
    assert_all_released(session.pool());
}

#[test]
fn test_state_queries_from_callback_during_detach() {
    let session = Arc::new(MockSession::new(1));
    let sink = DeliverySink::new(SinkConfig::default());

    let (started_tx, started_rx) = flume::bounded::<()>(1);
    let answered = Arc::new(Mutex::new(None));
    {
        let weak = Arc::downgrade(&sink);
        let answered = answered.clone();
        sink.set_frame_callback(move |_frame: FrameBuffer| {
            let _ = started_tx.send(());
            // Give detach time to start waiting on this delivery.
            thread::sleep(Duration::from_millis(200));
            if let Some(sink) = weak.upgrade() {
                let attached = sink.is_attached();
                let _ = sink.delivery_stats();
                let _ = sink.drop_snapshot();
                *answered.lock().unwrap() = Some(attached);
            }
            Ok(())
        });
    }

    sink.attach(&*session).unwrap();
    let producer = {
        let session = session.clone();
        thread::spawn(move || session.frame())
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (done_tx, done_rx) = flume::bounded(1);
    let detacher = {
        let sink = sink.clone();
        let session = session.clone();
        thread::spawn(move || {
            let _ = done_tx.send(sink.detach(&*session).is_ok());
        })
    };

    assert!(
        matches!(done_rx.recv_timeout(Duration::from_secs(3)), Ok(true)),
        "detach did not finish"
    );
    detacher.join().unwrap();
    assert!(producer.join().unwrap());

    assert!(answered.lock().unwrap().is_some());
    assert!(!sink.is_attached());
    assert_all_released(session.pool());
}

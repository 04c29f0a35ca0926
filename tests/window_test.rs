use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::{Duration, Instant};
use veil_core::crypto::SessionKey;
use veil_core::entry::{BufferEntry, Placement, SendEntry, Status};
use veil_core::identity::PeerId;
use veil_core::protocol::{MAX_BUF_FACT, MessageKind, PACKET_HEADER_LEN, build_part};
use veil_core::scheduler::{self, AssemblyContext, LoadEstimate, PlanOutcome};
use veil_core::stats::CoreStats;
use veil_core::transport::SendOutcome;

fn up_entry(now: Instant) -> BufferEntry {
    let mut rng = StdRng::seed_from_u64(1);
    let mut be = BufferEntry::new(PeerId::from_bytes([7; 64]), now);
    be.skey_local = Some(SessionKey::random(&mut rng));
    be.skey_remote = Some(SessionKey::random(&mut rng));
    be.set_status(Status::Up, now);
    be.max_bpm = 80_000;
    be.available_send_window = 80_000;
    be
}

fn plan_one(
    be: &mut BufferEntry,
    now: Instant,
    rng: &mut StdRng,
    stats: &CoreStats,
) -> Option<veil_core::scheduler::PlannedFrame> {
    let mut ctx = AssemblyContext {
        now,
        now_unix: 1_700_000_000,
        rng,
        padding: &[],
        stats,
        load: LoadEstimate::default(),
        padding_enabled: false,
        max_bpm_up: 600_000,
    };
    match scheduler::plan_frame(be, &mut ctx, false, |_, _| SendOutcome::Sent) {
        PlanOutcome::Planned(plan) => Some(plan),
        _ => None,
    }
}

#[test]
fn window_charged_exactly_frame_size() {
    let now = Instant::now();
    let mut be = up_entry(now);
    let stats = CoreStats::default();
    let part = build_part(MessageKind(40), &[0x11; 40]);
    let part_len = part.len();
    be.enqueue(SendEntry::ready(part, 1000, now, Placement::None));

    let mut rng = StdRng::seed_from_u64(2);
    let window_before = be.available_send_window;
    let plan = plan_one(&mut be, now, &mut rng, &stats).expect("frame planned");
    let frame_len = plan.bytes.len();
    assert_eq!(frame_len, PACKET_HEADER_LEN + part_len);

    scheduler::finish_frame(
        &mut be,
        plan,
        SendOutcome::Sent,
        &[],
        &stats,
        now,
        0,
        600_000,
    );
    assert_eq!(
        be.available_send_window,
        window_before - frame_len as i64
    );
    assert_eq!(be.last_seq_send, 2);
    assert!(be.send_buffer.is_empty());
}

#[test]
fn sequence_numbers_strictly_increase() {
    let now = Instant::now();
    let mut be = up_entry(now);
    let stats = CoreStats::default();
    let mut rng = StdRng::seed_from_u64(3);
    let mut last_seq = None;
    for i in 0..5u8 {
        be.enqueue(SendEntry::ready(
            build_part(MessageKind(40), &[i; 32]),
            1000,
            now,
            Placement::None,
        ));
        be.last_send_attempt = None; // isolate the test from the gate
        let plan = plan_one(&mut be, now, &mut rng, &stats).expect("frame planned");
        // Decrypt the sealed frame and read the sequence it carries.
        let key = be.skey_local.clone().unwrap();
        let mut frame = plan.bytes.clone();
        veil_core::crypto::open_frame(&key, &mut frame).unwrap();
        let header = veil_core::protocol::PacketHeader::parse(&frame).unwrap();
        if let Some(prev) = last_seq {
            assert!(header.sequence_number > prev);
        }
        last_seq = Some(header.sequence_number);
        scheduler::finish_frame(
            &mut be,
            plan,
            SendOutcome::Sent,
            &[],
            &stats,
            now,
            0,
            600_000,
        );
    }
}

#[test]
fn refill_matches_rate_minus_overflow() {
    let now = Instant::now();
    let mut be = up_entry(now);
    let stats = CoreStats::default();
    be.max_bpm = 60_000; // 1000 bytes per second
    be.available_send_window = 0;
    be.last_bps_update = now;

    be.refill_window(now + Duration::from_secs(30), &stats);
    assert_eq!(be.available_send_window, 30_000);

    // Long idle: refill caps at max_bpm * MAX_BUF_FACT, the rest is
    // counted as lost credit.
    be.refill_window(now + Duration::from_secs(600), &stats);
    assert_eq!(be.available_send_window, (60_000 * MAX_BUF_FACT) as i64);
    let expected_lost = 570_000 + 30_000 - 60_000 * MAX_BUF_FACT;
    assert_eq!(stats.lost_send_credit(), expected_lost);
}

#[test]
fn not_ready_outcome_requeues_consumed_entries() {
    let now = Instant::now();
    let mut be = up_entry(now);
    let stats = CoreStats::default();
    be.enqueue(SendEntry::ready(
        build_part(MessageKind(40), &[1; 16]),
        1000,
        now,
        Placement::None,
    ));
    let mut rng = StdRng::seed_from_u64(4);
    let window_before = be.available_send_window;
    let plan = plan_one(&mut be, now, &mut rng, &stats).expect("frame planned");
    assert!(be.send_buffer.is_empty());

    scheduler::finish_frame(
        &mut be,
        plan,
        SendOutcome::NotReady,
        &[],
        &stats,
        now,
        0,
        600_000,
    );
    // Temporary failure: message back in the queue, window untouched.
    assert_eq!(be.send_buffer.len(), 1);
    assert_eq!(be.available_send_window, window_before);
}

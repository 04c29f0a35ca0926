use crate::crypto;
use crate::entry::{BufferEntry, Placement, SendBody, SendEntry};
use crate::handler::{PaddingCallback, SendObserver};
use crate::protocol::{
    EXPECTED_MTU, EXTREME_PRIORITY, MAX_STREAM_FRAME, MINIMUM_SAMPLE_COUNT, MessageKind,
    PACKET_HEADER_LEN, PART_HEADER_LEN, PacketHeader, PartIter, min_sample_time,
};
use crate::stats::CoreStats;
use crate::transport::SendOutcome;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Coarse resource pressure, in percent of the configured budgets.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadEstimate {
    pub cpu: u32,
    pub upload: u32,
    pub download: u32,
}

/// Everything `plan_frame` needs besides the entry itself.
pub struct AssemblyContext<'a> {
    pub now: Instant,
    pub now_unix: u32,
    pub rng: &'a mut dyn rand::RngCore,
    /// (minimum useful space, callback) pairs, cloned out of the
    /// registry so no registry lock is held during assembly.
    pub padding: &'a [(usize, PaddingCallback)],
    pub stats: &'a CoreStats,
    pub load: LoadEstimate,
    pub padding_enabled: bool,
    pub max_bpm_up: u64,
}

/// A sealed frame ready for the transport, plus enough context to
/// finish or roll back the attempt once the driver answered.
pub struct PlannedFrame {
    pub bytes: Vec<u8>,
    /// Parts region before encryption, for the send observers.
    plaintext_parts: Vec<u8>,
    pub priority: u64,
    consumed: Vec<SendEntry>,
}

pub enum PlanOutcome {
    Planned(PlannedFrame),
    /// Nothing to send right now.
    Idle,
    /// The driver declared the session dead before we built anything.
    SessionDead,
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while a != 0 {
        let t = a;
        a = b % a;
        b = t;
    }
    b
}

/// Frequency gate: one frame per expected transmission interval, with
/// a floor that guarantees the scheduler still runs at least
/// `MINIMUM_SAMPLE_COUNT` times per sampling window for small peers.
pub fn check_send_frequency(be: &BufferEntry, now: Instant) -> bool {
    let bytes_per_frame = if be.mtu == 0 {
        EXPECTED_MTU as u64
    } else {
        be.mtu as u64
    };
    let mut interval_ms = bytes_per_frame * 60_000 / be.max_bpm.max(1) / 2;
    let ceiling = 2 * min_sample_time().as_millis() as u64 / MINIMUM_SAMPLE_COUNT as u64;
    interval_ms = interval_ms.min(ceiling);
    match be.last_send_attempt {
        Some(last) => now.saturating_duration_since(last) >= Duration::from_millis(interval_ms),
        None => true,
    }
}

/// Upload-side admission policy: beyond 150% load everything drops,
/// beyond 100% only EXTREME passes, between 50% and 100% the required
/// priority grows cubically with the excess.
pub fn outgoing_check(priority: u64, upload_load: u32) -> bool {
    if upload_load >= 150 {
        return false;
    }
    if upload_load > 100 {
        return priority >= EXTREME_PRIORITY as u64;
    }
    if upload_load <= 50 {
        return true;
    }
    let delta = (upload_load - 50) as u64;
    priority > delta * delta * delta
}

/// Greedy 0/1-knapsack approximation; assumes `entries` is sorted by
/// descending priority per byte. Used under CPU pressure.
pub fn approximate_knapsack(entries: &mut [SendEntry], capacity: usize) -> u64 {
    let mut left = capacity;
    let mut achieved = 0u64;
    for entry in entries.iter_mut() {
        if entry.len <= left {
            entry.selected = true;
            left -= entry.len;
            achieved += entry.priority as u64;
        } else {
            entry.selected = false;
        }
    }
    achieved
}

/// Exact 0/1-knapsack by dynamic programming over
/// (priority, length) against `capacity`.
///
/// All lengths and the capacity are divided by their common gcd first,
/// which shrinks the table by the alignment of typical messages.
pub fn solve_knapsack(entries: &mut [SendEntry], capacity: usize) -> u64 {
    let count = entries.len();

    // Fast path: everything fits.
    let total: usize = entries.iter().map(|e| e.len).sum();
    if total <= capacity {
        let mut achieved = 0u64;
        for entry in entries.iter_mut() {
            entry.selected = true;
            achieved += entry.priority as u64;
        }
        return achieved;
    }

    let mut divisor = capacity;
    for entry in entries.iter() {
        if entry.len > 0 {
            divisor = gcd(divisor, entry.len);
        }
    }
    debug_assert!(divisor != 0);
    let capacity = capacity / divisor;
    let eff_len: Vec<usize> = entries.iter().map(|e| e.len / divisor).collect();

    // value[i][j]: best priority of any subset of the first i entries
    // filling exactly weight j. Unreachable weights carry a sentinel
    // negative enough that no chain of additions reaches a real value,
    // so the reconstruction below cannot follow a phantom path.
    const UNREACHABLE: i64 = i64::MIN / 4;
    let width = capacity + 1;
    let mut value = vec![0i64; (count + 1) * width];
    for cell in value.iter_mut().take(width).skip(1) {
        *cell = UNREACHABLE;
    }
    for i in 1..=count {
        for j in 0..width {
            let leave = value[(i - 1) * width + j];
            value[i * width + j] = if j >= eff_len[i - 1] {
                let take =
                    entries[i - 1].priority as i64 + value[(i - 1) * width + j - eff_len[i - 1]];
                leave.max(take)
            } else {
                leave
            };
        }
    }

    // Best reachable weight, preferring fuller frames on ties.
    let mut best = 0i64;
    let mut j = 0usize;
    for (weight, &cell) in value[count * width..].iter().enumerate() {
        if cell >= best {
            best = cell;
            j = weight;
        }
    }

    for entry in entries.iter_mut() {
        entry.selected = false;
    }
    for i in (1..=count).rev() {
        if j >= eff_len[i - 1]
            && value[(i - 1) * width + j - eff_len[i - 1]] + entries[i - 1].priority as i64
                == value[i * width + j]
        {
            j -= eff_len[i - 1];
            entries[i - 1].selected = true;
        }
    }
    debug_assert_eq!(j, 0);
    best.max(0) as u64
}

/// Selects the subset of the queue for one frame. Returns the total
/// frame size (header included) and the achieved priority, or 0 when
/// the scheduler should defer.
fn select_messages(
    be: &mut BufferEntry,
    now: Instant,
    rng: &mut dyn rand::RngCore,
    cpu_load: u32,
) -> (usize, u64) {
    for entry in &mut be.send_buffer {
        entry.selected = false;
    }
    if be.send_buffer.is_empty() {
        return (0, 0);
    }

    if be.mtu == 0 {
        select_streaming(be, now, rng)
    } else {
        select_packetized(be, rng, cpu_load)
    }
}

/// Streaming transports: walk the priority/length-sorted queue. Always
/// admit EXTREME entries, then fill the window, batching small frames.
fn select_streaming(
    be: &mut BufferEntry,
    now: Instant,
    rng: &mut dyn rand::RngCore,
) -> (usize, u64) {
    let mut total = PACKET_HEADER_LEN;
    let mut priority = 0u64;
    let mut deadline: Option<Instant> = None;
    let mut i = 0;

    while i < be.send_buffer.len() {
        let entry = &mut be.send_buffer[i];
        if total + entry.len < MAX_STREAM_FRAME - 64 && entry.priority >= EXTREME_PRIORITY {
            entry.selected = true;
            deadline = Some(deadline.map_or(entry.deadline, |d| d.min(entry.deadline)));
            priority += entry.priority as u64;
            total += entry.len;
            i += 1;
        } else {
            break;
        }
    }
    // Wait for the window to cover the highest-priority message before
    // admitting anything else, so large messages cannot starve.
    if i == 0 && be.send_buffer[0].len as i64 > be.available_send_window {
        return (0, 0);
    }
    while i < be.send_buffer.len() && be.available_send_window > total as i64 {
        let entry = &mut be.send_buffer[i];
        if (entry.len + total) as i64 <= be.available_send_window
            && total + entry.len < MAX_STREAM_FRAME - 64
        {
            entry.selected = true;
            deadline = Some(deadline.map_or(entry.deadline, |d| d.min(entry.deadline)));
            total += entry.len;
            priority += entry.priority as u64;
        } else {
            entry.selected = false;
            if total == PACKET_HEADER_LEN {
                return (0, 0);
            }
        }
        i += 1;
    }

    let deadline_close =
        deadline.is_some_and(|d| d <= now + Duration::from_millis(500));
    if total == PACKET_HEADER_LEN
        || (priority < EXTREME_PRIORITY as u64
            && total / PACKET_HEADER_LEN < 4
            && !deadline_close
            && rng.gen_range(0..16) != 0)
    {
        // Small-message batching: defer 15 times out of 16 so tiny
        // frames still eventually leave an otherwise idle queue.
        return (0, 0);
    }
    (total, priority)
}

/// Packetized transports: knapsack against the datagram capacity,
/// falling back probabilistically to the greedy pass under CPU load.
fn select_packetized(
    be: &mut BufferEntry,
    rng: &mut dyn rand::RngCore,
    cpu_load: u32,
) -> (usize, u64) {
    let capacity = be.mtu as usize - PACKET_HEADER_LEN;
    let priority = if cpu_load > 50 {
        let approx_odds = (100 - cpu_load.min(100)) * 2;
        if rng.gen_range(0..=approx_odds) == 0 {
            approximate_knapsack(&mut be.send_buffer, capacity)
        } else {
            solve_knapsack(&mut be.send_buffer, capacity)
        }
    } else {
        solve_knapsack(&mut be.send_buffer, capacity)
    };

    let selected: usize = be
        .send_buffer
        .iter()
        .filter(|e| e.selected)
        .map(|e| e.len)
        .sum();
    if selected == 0 || selected > capacity {
        if selected > capacity {
            warn!(
                "{}: knapsack overcommitted {selected} bytes into {capacity}",
                be.peer
            );
        }
        return (0, 0);
    }
    // A sub-MTU window only blocks ordinary traffic; HANGUP and key
    // exchange must still leave.
    if (be.available_send_window) < be.mtu as i64 && priority < EXTREME_PRIORITY as u64 {
        return (0, 0);
    }
    (be.mtu as usize, priority)
}

/// Invokes deferred builders of the selected entries; failed builders
/// drop their entry. Returns how many parts are ready.
fn prepare_selected(be: &mut BufferEntry, stats: &CoreStats) -> usize {
    let mut ready = 0;
    let mut failed = Vec::new();
    for (i, entry) in be.send_buffer.iter_mut().enumerate() {
        if !entry.selected {
            continue;
        }
        match &mut entry.body {
            SendBody::Ready(_) => ready += 1,
            SendBody::Deferred(_) => {
                let SendBody::Deferred(build) =
                    std::mem::replace(&mut entry.body, SendBody::Ready(Vec::new()))
                else {
                    unreachable!()
                };
                let mut buf = vec![0u8; entry.len];
                if build(&mut buf) {
                    entry.body = SendBody::Ready(buf);
                    ready += 1;
                } else {
                    failed.push(i);
                }
            }
        }
    }
    for &i in failed.iter().rev() {
        let entry = be.send_buffer.remove(i);
        stats.add_dropped(entry.len as u64);
    }
    ready
}

/// Extracts the selected entries in emission order: a random
/// permutation re-ordered so PLACE_HEAD entries lead and PLACE_TAIL
/// entries trail, preserving mutual order within each class.
fn drain_selected_permuted(
    be: &mut BufferEntry,
    rng: &mut dyn rand::RngCore,
) -> Vec<SendEntry> {
    let mut selected = Vec::new();
    let mut i = 0;
    while i < be.send_buffer.len() {
        if be.send_buffer[i].selected {
            selected.push(be.send_buffer.remove(i));
        } else {
            i += 1;
        }
    }
    // Fisher-Yates, then a stable three-way partition.
    for j in (1..selected.len()).rev() {
        let k = rng.gen_range(0..=j);
        selected.swap(j, k);
    }
    let mut ordered = Vec::with_capacity(selected.len());
    let mut middle = Vec::new();
    let mut tail = Vec::new();
    for entry in selected {
        match entry.placement {
            Placement::Head => ordered.push(entry),
            Placement::None => middle.push(entry),
            Placement::Tail => tail.push(entry),
        }
    }
    ordered.extend(middle);
    ordered.extend(tail);
    ordered
}

/// Runs the full outbound assembly for one entry, under the table
/// lock: gate, refill, select, prepare, permute, pad, seal. The
/// caller emits the frame with the lock released and then calls
/// [`finish_frame`].
///
/// `would_try` probes the bound driver; `force` skips the frequency
/// gate (HANGUP).
pub fn plan_frame(
    be: &mut BufferEntry,
    ctx: &mut AssemblyContext<'_>,
    force: bool,
    would_try: impl Fn(usize, bool) -> SendOutcome,
) -> PlanOutcome {
    if !force && !check_send_frequency(be, ctx.now) {
        return PlanOutcome::Idle;
    }
    be.refill_window(ctx.now, ctx.stats);

    let (mut total, priority) = select_messages(be, ctx.now, ctx.rng, ctx.load.cpu);
    if total == 0 {
        be.expire_send_buffer(ctx.now, ctx.load.cpu, ctx.max_bpm_up, ctx.stats);
        return PlanOutcome::Idle;
    }

    match would_try(total, priority >= EXTREME_PRIORITY as u64) {
        SendOutcome::Dead => return PlanOutcome::SessionDead,
        SendOutcome::NotReady => {
            be.expire_send_buffer(ctx.now, ctx.load.cpu, ctx.max_bpm_up, ctx.stats);
            return PlanOutcome::Idle;
        }
        SendOutcome::Sent => {}
    }

    if !outgoing_check(priority, ctx.load.upload) || prepare_selected(be, ctx.stats) == 0 {
        be.expire_send_buffer(ctx.now, ctx.load.cpu, ctx.max_bpm_up, ctx.stats);
        return PlanOutcome::Idle;
    }

    let consumed = drain_selected_permuted(be, ctx.rng);
    if be.mtu == 0 {
        // Builders may have dropped entries; shrink a streaming frame
        // to what actually survived.
        total = PACKET_HEADER_LEN + consumed.iter().map(|e| e.len).sum::<usize>();
    }

    let mut frame = vec![0u8; total];
    let mut p = PACKET_HEADER_LEN;
    for entry in &consumed {
        let SendBody::Ready(bytes) = &entry.body else {
            unreachable!("prepare_selected left a deferred body");
        };
        debug_assert_eq!(bytes.len(), entry.len);
        frame[p..p + entry.len].copy_from_slice(bytes);
        p += entry.len;
    }

    // Spare room: registered padding callbacks in round-robin until no
    // callback fits, then random noise.
    loop {
        let mut progressed = false;
        for (min_padding, callback) in ctx.padding {
            let spare = total - p;
            if *min_padding <= spare && spare > 0 {
                let used = callback(&be.peer, &mut frame[p..total]);
                debug_assert!(used <= spare);
                if used > 0 && used <= spare {
                    p += used;
                    progressed = true;
                }
            }
        }
        if !progressed {
            break;
        }
    }
    if ctx.padding_enabled && p + PART_HEADER_LEN <= total {
        let noise_len = total - p;
        crate::protocol::PartHeader {
            size: noise_len as u16,
            kind: MessageKind::NOISE,
        }
        .write_to(&mut frame[p..]);
        ctx.rng.fill_bytes(&mut frame[p + PART_HEADER_LEN..total]);
        ctx.stats.add_noise((noise_len - PART_HEADER_LEN) as u64);
        p = total;
    }
    frame.truncate(p);

    let plaintext_parts = frame[PACKET_HEADER_LEN..].to_vec();
    let header = PacketHeader {
        mac: [0u8; crate::protocol::MAC_LEN],
        sequence_number: be.last_seq_send,
        time_stamp: ctx.now_unix,
        bandwidth: be.idealized_limit.min(u32::MAX as u64) as u32,
    };
    header.write_to(&mut frame);

    let Some(key) = &be.skey_local else {
        // Session lost its key mid-flight; requeue nothing, the
        // entries were already consumed into this frame.
        debug!("{}: no local session key at seal time", be.peer);
        return PlanOutcome::SessionDead;
    };
    crypto::seal_frame(key, &mut frame);
    be.last_seq_send = be.last_seq_send.wrapping_add(1);
    ctx.stats
        .add_encrypted((frame.len() - crate::protocol::MAC_LEN) as u64);

    PlanOutcome::Planned(PlannedFrame {
        bytes: frame,
        plaintext_parts,
        priority,
        consumed,
    })
}

/// Books the result of the transport send, still / again under the
/// table lock.
pub fn finish_frame(
    be: &mut BufferEntry,
    plan: PlannedFrame,
    outcome: SendOutcome,
    observers: &[SendObserver],
    stats: &CoreStats,
    ctx_now: Instant,
    cpu_load: u32,
    max_bpm_up: u64,
) {
    match outcome {
        SendOutcome::Sent => {
            let size = plan.bytes.len();
            be.available_send_window -= size as i64;
            stats.add_transmitted(size as u64);
            if be.idealized_limit > be.max_transmitted_limit {
                be.max_transmitted_limit = be.idealized_limit;
            } else {
                be.max_transmitted_limit =
                    (be.idealized_limit + be.max_transmitted_limit * 3) / 4;
            }
            if !observers.is_empty() {
                for part in PartIter::new(&plan.plaintext_parts).flatten() {
                    for observer in observers {
                        observer(&be.peer, part.0, &part.1);
                    }
                }
            }
        }
        SendOutcome::NotReady => {
            // Temporary: put the (now pre-built) parts back for the
            // next tick.
            for entry in plan.consumed {
                be.enqueue(entry);
            }
        }
        SendOutcome::Dead => {
            for entry in plan.consumed {
                stats.add_dropped(entry.len as u64);
            }
        }
    }
    be.expire_send_buffer(ctx_now, cpu_load, max_bpm_up, stats);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn entry_with(lens_pris: &[(usize, u32)]) -> BufferEntry {
        let mut be = BufferEntry::new(PeerId::from_bytes([1; 64]), Instant::now());
        let now = Instant::now();
        for &(len, pri) in lens_pris {
            be.enqueue(SendEntry::ready(vec![0; len], pri, now, Placement::None));
        }
        be
    }

    #[test]
    fn knapsack_takes_everything_when_it_fits() {
        let mut be = entry_with(&[(100, 1), (200, 2), (300, 3)]);
        let achieved = solve_knapsack(&mut be.send_buffer, 1000);
        assert_eq!(achieved, 6);
        assert!(be.send_buffer.iter().all(|e| e.selected));
    }

    #[test]
    fn knapsack_maximizes_priority() {
        let mut be = entry_with(&[(500, 10), (300, 5), (700, 6), (200, 1)]);
        let achieved = solve_knapsack(&mut be.send_buffer, 1000);
        assert_eq!(achieved, 16);
        let mut lens: Vec<usize> = be
            .send_buffer
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.len)
            .collect();
        lens.sort_unstable();
        assert_eq!(lens, vec![200, 300, 500]);
    }

    #[test]
    fn knapsack_optimal_under_tight_capacity() {
        let mut be = entry_with(&[(500, 10), (300, 5), (700, 6), (200, 1)]);
        let achieved = solve_knapsack(&mut be.send_buffer, 952);
        assert_eq!(achieved, 15);
        let total: usize = be
            .send_buffer
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.len)
            .sum();
        assert!(total <= 952);
    }

    #[test]
    fn approximation_respects_capacity() {
        let mut be = entry_with(&[(500, 10), (300, 5), (700, 6), (200, 1)]);
        let achieved = approximate_knapsack(&mut be.send_buffer, 952);
        let total: usize = be
            .send_buffer
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.len)
            .sum();
        assert!(total <= 952);
        assert!(achieved > 0);
    }

    #[test]
    fn outgoing_check_cubic_policy() {
        assert!(outgoing_check(0, 50));
        assert!(!outgoing_check(0, 150));
        assert!(outgoing_check(EXTREME_PRIORITY as u64, 120));
        assert!(!outgoing_check(1000, 120));
        // At 60% load the bar is 10^3.
        assert!(!outgoing_check(1000, 60));
        assert!(outgoing_check(1001, 60));
    }

    #[test]
    fn placement_flags_order_the_frame() {
        let mut be = BufferEntry::new(PeerId::from_bytes([2; 64]), Instant::now());
        let now = Instant::now();
        for (i, placement) in [
            Placement::Tail,
            Placement::None,
            Placement::Head,
            Placement::None,
            Placement::Head,
        ]
        .iter()
        .enumerate()
        {
            let mut entry = SendEntry::ready(vec![i as u8; 8], 1, now, *placement);
            entry.selected = true;
            be.send_buffer.push(entry);
        }
        let mut rng = StdRng::seed_from_u64(3);
        let ordered = drain_selected_permuted(&mut be, &mut rng);
        assert_eq!(ordered[0].placement, Placement::Head);
        assert_eq!(ordered[1].placement, Placement::Head);
        assert_eq!(ordered[4].placement, Placement::Tail);
    }
}

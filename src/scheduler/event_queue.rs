//! Event queue — cooperative dispatch of periodic and deferred callables
//!
//! A fixed-capacity min-heap ordered by `(due, seq)`. Periodic tasks are
//! re-armed at `previous_due + period` when they complete, so releases
//! never drift with dispatch latency. Each task carries a small state
//! machine (`Idle → Scheduled → Running → Scheduled | Idle`) and a
//! generation number; cancelling or re-arming bumps the generation and
//! stale heap entries are discarded lazily when they reach the top.
//!
//! Interrupt work never touches the heap directly: device handlers post
//! to an [`Inbox`] and unpark the dispatcher, which moves the edges into
//! the queue as deferred events.

use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use heapless::binary_heap::{BinaryHeap, Min};
use log::{info, trace, warn};

use super::{RunControl, RunState, Scheduler, Wake};
use crate::config::BikeConfig;
use crate::error::ConfigError;
use crate::logger::TaskLogger;
use crate::spsc::{Consumer, Producer, SpscRing};
use crate::task::{TaskId, TaskState};
use crate::task_set::TaskSet;
use crate::timer::SysTimer;

/// Heap slots: one per periodic task plus room for deferred interrupt work
pub const QUEUE_CAPACITY: usize = 32;

/// Depth of the reset timestamp ring (one slot is reserved)
pub const INBOX_DEPTH: usize = 8;

/// Upper bound on one idle wait when nothing is queued
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Unit of work carried by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// One activation of a task
    Task(TaskId),
    /// Gear acknowledged after a joystick edge
    GearShift(u8),
    /// Latched reset presses to serve; `pressed_us` is the edge timestamp
    ResetPress { pressed_us: u64 },
}

/// Handle to a task's armed event, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle {
    task: TaskId,
    generation: u32,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    due: Instant,
    seq: u64,
    generation: u32,
    work: Work,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: TaskState,
    generation: u32,
    period: Option<Duration>,
    /// Due instant of the armed or running activation
    due: Option<Instant>,
}

impl Entry {
    const IDLE: Entry = Entry {
        state: TaskState::Idle,
        generation: 0,
        period: None,
        due: None,
    };
}

/// Fixed-capacity event queue
#[derive(Debug)]
pub struct EventQueue {
    heap: BinaryHeap<Event, Min, QUEUE_CAPACITY>,
    entries: [Entry; TaskId::COUNT],
    seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: [Entry::IDLE; TaskId::COUNT],
            seq: 0,
        }
    }

    /// Arm `task` to run at `first` and every `period` after it.
    ///
    /// Replaces whatever was armed for `task`. `None` if the queue is full.
    pub fn call_every(&mut self, task: TaskId, first: Instant, period: Duration) -> Option<EventHandle> {
        self.arm(task, first, Some(period))
    }

    /// Arm a single activation of `task` at `due`.
    pub fn call_at(&mut self, task: TaskId, due: Instant) -> Option<EventHandle> {
        self.arm(task, due, None)
    }

    /// Queue deferred work at `due`; false if the queue is full.
    pub fn post(&mut self, work: Work, due: Instant) -> bool {
        match work {
            Work::Task(task) => self.call_at(task, due).is_some(),
            _ => self.push(due, 0, work),
        }
    }

    /// Disarm the event behind `handle`. A running task finishes its
    /// activation but is not re-armed. False if the handle is stale.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        let entry = &mut self.entries[handle.task.index()];
        if entry.generation != handle.generation {
            return false;
        }
        match entry.state {
            TaskState::Idle => false,
            TaskState::Scheduled => {
                entry.state = TaskState::Idle;
                entry.generation = entry.generation.wrapping_add(1);
                entry.due = None;
                true
            }
            TaskState::Running => {
                entry.period = None;
                true
            }
        }
    }

    pub fn state(&self, task: TaskId) -> TaskState {
        self.entries[task.index()].state
    }

    /// Heap occupancy, including entries not yet discarded after a cancel
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Due instant of the earliest live event
    pub fn next_due(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|event| event.due)
    }

    /// Pop the earliest live event if it is due at `now`.
    ///
    /// A popped task moves to `Running` until [`complete`](Self::complete).
    pub fn pop_due(&mut self, now: Instant) -> Option<Work> {
        self.discard_stale();
        if self.heap.peek()?.due > now {
            return None;
        }
        let event = self.heap.pop()?;
        if let Work::Task(task) = event.work {
            let entry = &mut self.entries[task.index()];
            entry.state = TaskState::Running;
            entry.due = Some(event.due);
        }
        Some(event.work)
    }

    /// Finish the running activation of `task`, re-arming it if periodic.
    pub fn complete(&mut self, task: TaskId) {
        let entry = self.entries[task.index()];
        if entry.state != TaskState::Running {
            // Re-armed from inside its own body
            return;
        }
        match (entry.period, entry.due) {
            (Some(period), Some(due)) => {
                let next = due + period;
                if self.push(next, entry.generation, Work::Task(task)) {
                    let entry = &mut self.entries[task.index()];
                    entry.state = TaskState::Scheduled;
                    entry.due = Some(next);
                } else {
                    warn!("event queue: full, {} dropped", task);
                    self.entries[task.index()] = Entry {
                        generation: entry.generation.wrapping_add(1),
                        ..Entry::IDLE
                    };
                }
            }
            _ => {
                let entry = &mut self.entries[task.index()];
                entry.state = TaskState::Idle;
                entry.due = None;
            }
        }
    }

    fn arm(&mut self, task: TaskId, due: Instant, period: Option<Duration>) -> Option<EventHandle> {
        let generation = self.entries[task.index()].generation.wrapping_add(1);
        if !self.push(due, generation, Work::Task(task)) {
            return None;
        }
        // A task re-arming itself from its body is left alone by `complete`.
        self.entries[task.index()] = Entry {
            state: TaskState::Scheduled,
            generation,
            period,
            due: Some(due),
        };
        Some(EventHandle { task, generation })
    }

    fn push(&mut self, due: Instant, generation: u32, work: Work) -> bool {
        let event = Event {
            due,
            seq: self.seq,
            generation,
            work,
        };
        self.seq = self.seq.wrapping_add(1);
        self.heap.push(event).is_ok()
    }

    fn is_live(&self, event: &Event) -> bool {
        match event.work {
            Work::Task(task) => {
                let entry = &self.entries[task.index()];
                entry.state == TaskState::Scheduled && entry.generation == event.generation
            }
            Work::GearShift(_) | Work::ResetPress { .. } => true,
        }
    }

    fn discard_stale(&mut self) {
        loop {
            let live = match self.heap.peek() {
                Some(event) => self.is_live(event),
                None => return,
            };
            if live {
                return;
            }
            self.heap.pop();
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt-to-dispatcher mailbox
///
/// Both joystick lines only raise `gear_changed`; the dispatcher reads the
/// gear level from the device itself, so racing edges always settle on the
/// device's final gear. Reset edges carry their timestamp through an SPSC
/// ring. Its producer is taken with `try_lock` and never waited on: an edge
/// that finds it busy skips the timestamp, and its press stays latched in
/// the device for the next served reset event.
#[derive(Debug)]
pub struct Inbox {
    gear_changed: AtomicBool,
    reset_tx: spin::Mutex<Producer<u64, INBOX_DEPTH>>,
    /// Dispatcher only
    reset_rx: spin::Mutex<Consumer<u64, INBOX_DEPTH>>,
    dispatcher: spin::Once<Thread>,
}

impl Default for Inbox {
    fn default() -> Self {
        let (tx, rx) = SpscRing::new().split();
        Self {
            gear_changed: AtomicBool::new(false),
            reset_tx: spin::Mutex::new(tx),
            reset_rx: spin::Mutex::new(rx),
            dispatcher: spin::Once::new(),
        }
    }
}

impl Inbox {
    fn post_gear(&self) {
        self.gear_changed.store(true, Ordering::Release);
        self.wake();
    }

    fn post_reset(&self, pressed_us: u64) {
        match self.reset_tx.try_lock() {
            Some(mut tx) => {
                if !tx.push(pressed_us) {
                    // Undrained timestamps ahead of this one serve it.
                    warn!("inbox: reset timestamp dropped, ring full");
                }
            }
            None => trace!("inbox: reset line busy, timestamp skipped"),
        }
        self.wake();
    }

    fn wake(&self) {
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.unpark();
        }
    }

    fn has_pending(&self) -> bool {
        self.gear_changed.load(Ordering::Acquire) || !self.reset_rx.lock().is_empty()
    }

    /// Post at most one gear and one reset event; a reset event serves
    /// every latched press, so only the oldest timestamp is kept.
    fn drain_into(&self, queue: &mut EventQueue, now: Instant, current_gear: impl FnOnce() -> u8) {
        if self.gear_changed.swap(false, Ordering::AcqRel) {
            let gear = current_gear();
            if !queue.post(Work::GearShift(gear), now) {
                warn!("event queue: full, gear {} dropped", gear);
            }
        }

        let mut rx = self.reset_rx.lock();
        if let Some(pressed_us) = rx.pop() {
            while rx.pop().is_some() {}
            if !queue.post(Work::ResetPress { pressed_us }, now) {
                warn!("event queue: full, reset event dropped");
            }
        }
    }
}

/// Run `tasks` from an event queue on the calling context until stopped.
///
/// Every task is armed at its phase and re-armed at its period. With an
/// `inbox`, device edges are served as deferred events in due order.
pub(crate) fn dispatch(
    tasks: &TaskSet,
    logger: &TaskLogger,
    control: &RunControl,
    inbox: Option<&Inbox>,
) {
    let mut queue = EventQueue::new();
    let origin = Instant::now();
    for spec in tasks.specs() {
        if queue.call_every(spec.id, origin + spec.phase, spec.period).is_none() {
            warn!("event queue: full, {} not armed", spec.id);
        }
    }

    loop {
        if let Some(inbox) = inbox {
            inbox.drain_into(&mut queue, Instant::now(), || {
                tasks.gear_device().current_gear()
            });
        }

        let deadline = queue
            .next_due()
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);
        let pending = || inbox.is_some_and(Inbox::has_pending);
        match control.wait_until(deadline, pending) {
            Wake::Stop => return,
            Wake::Interrupt => continue,
            Wake::Deadline => {}
        }

        // One callable per pass so interrupt work is merged in between.
        if let Some(work) = queue.pop_due(Instant::now()) {
            match work {
                Work::Task(task) => {
                    tasks.run(task, logger);
                    queue.complete(task);
                }
                Work::GearShift(gear) => tasks.apply_gear(gear),
                Work::ResetPress { pressed_us } => {
                    let served = tasks.process_resets();
                    trace!(
                        "reset: {} press(es) served {} us after the edge",
                        served,
                        logger.timer().elapsed_since(pressed_us)
                    );
                }
            }
        }
    }
}

/// Event queue with device edges delivered as deferred events
///
/// Joystick and button handlers only post to the [`Inbox`]; the gear is
/// acknowledged and the presses served on the dispatcher context.
#[derive(Debug)]
pub struct EventScheduling {
    timer: SysTimer,
    logger: TaskLogger,
    control: RunControl,
    inbox: Arc<Inbox>,
}

impl Scheduler for EventScheduling {
    const NAME: &'static str = "event";

    fn new(config: &BikeConfig, timer: SysTimer) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            timer,
            logger: TaskLogger::new(timer),
            control: RunControl::new(),
            inbox: Arc::default(),
        })
    }

    fn attach(&self, tasks: &Arc<TaskSet>) {
        let inbox = Arc::clone(&self.inbox);
        tasks
            .gear_device()
            .attach(Box::new(move |_gear| inbox.post_gear()));

        let inbox = Arc::clone(&self.inbox);
        let timer = self.timer;
        tasks
            .reset_device()
            .attach(Box::new(move || inbox.post_reset(timer.now_us())));
    }

    fn start(&self, tasks: &TaskSet) {
        if !self.control.begin() {
            warn!("{} scheduler: start ignored ({})", Self::NAME, self.control.state());
            return;
        }
        self.inbox.dispatcher.call_once(thread::current);
        info!("{} scheduler started", Self::NAME);

        dispatch(tasks, &self.logger, &self.control, Some(&self.inbox));

        self.control.finish();
        self.logger.report();
        info!("{} scheduler stopped", Self::NAME);
    }

    fn stop(&self) {
        if self.control.request_stop() {
            info!("{} scheduler: stop requested", Self::NAME);
        }
    }

    fn task_logger(&self) -> &TaskLogger {
        &self.logger
    }

    fn state(&self) -> RunState {
        self.control.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{LogDisplay, SimulatedSensor};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_pops_in_due_order() {
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        queue.call_at(TaskId::Display1, t0 + ms(30)).unwrap();
        queue.call_at(TaskId::Gear, t0 + ms(10)).unwrap();
        queue.call_at(TaskId::Speed, t0 + ms(20)).unwrap();

        let now = t0 + ms(100);
        assert_eq!(queue.pop_due(now), Some(Work::Task(TaskId::Gear)));
        assert_eq!(queue.pop_due(now), Some(Work::Task(TaskId::Speed)));
        assert_eq!(queue.pop_due(now), Some(Work::Task(TaskId::Display1)));
        assert_eq!(queue.pop_due(now), None);
    }

    #[test]
    fn test_equal_due_keeps_insertion_order() {
        let mut queue = EventQueue::new();
        let due = Instant::now();
        queue.call_at(TaskId::Reset, due).unwrap();
        assert!(queue.post(Work::GearShift(4), due));
        queue.call_at(TaskId::Gear, due).unwrap();

        assert_eq!(queue.pop_due(due), Some(Work::Task(TaskId::Reset)));
        assert_eq!(queue.pop_due(due), Some(Work::GearShift(4)));
        assert_eq!(queue.pop_due(due), Some(Work::Task(TaskId::Gear)));
    }

    #[test]
    fn test_not_due_yet() {
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        queue.call_at(TaskId::Speed, t0 + ms(50)).unwrap();
        assert_eq!(queue.pop_due(t0), None);
        assert_eq!(queue.next_due(), Some(t0 + ms(50)));
        assert_eq!(queue.state(TaskId::Speed), TaskState::Scheduled);
    }

    #[test]
    fn test_periodic_rearm_without_drift() {
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        queue.call_every(TaskId::Speed, t0, ms(400)).unwrap();

        // Dispatched late: the next release still counts from the due instant.
        assert_eq!(queue.pop_due(t0 + ms(7)), Some(Work::Task(TaskId::Speed)));
        assert_eq!(queue.state(TaskId::Speed), TaskState::Running);
        queue.complete(TaskId::Speed);
        assert_eq!(queue.state(TaskId::Speed), TaskState::Scheduled);
        assert_eq!(queue.next_due(), Some(t0 + ms(400)));
    }

    #[test]
    fn test_one_shot_goes_idle() {
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        queue.call_at(TaskId::Temperature, t0).unwrap();
        assert_eq!(queue.pop_due(t0), Some(Work::Task(TaskId::Temperature)));
        queue.complete(TaskId::Temperature);
        assert_eq!(queue.state(TaskId::Temperature), TaskState::Idle);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_scheduled() {
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        let handle = queue.call_every(TaskId::Gear, t0, ms(800)).unwrap();
        assert!(queue.cancel(handle));
        assert!(!queue.cancel(handle));
        assert_eq!(queue.state(TaskId::Gear), TaskState::Idle);
        // Stale heap entry is skipped
        assert_eq!(queue.pop_due(t0 + ms(1000)), None);
        assert_eq!(queue.next_due(), None);
    }

    #[test]
    fn test_cancel_running_stops_rearm() {
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        let handle = queue.call_every(TaskId::Reset, t0, ms(800)).unwrap();
        assert_eq!(queue.pop_due(t0), Some(Work::Task(TaskId::Reset)));
        assert!(queue.cancel(handle));
        queue.complete(TaskId::Reset);
        assert_eq!(queue.state(TaskId::Reset), TaskState::Idle);
        assert_eq!(queue.next_due(), None);
    }

    #[test]
    fn test_rearm_supersedes_previous() {
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        let old = queue.call_at(TaskId::Display2, t0 + ms(10)).unwrap();
        let new = queue.call_at(TaskId::Display2, t0 + ms(20)).unwrap();
        assert_ne!(old, new);
        assert!(!queue.cancel(old));

        assert_eq!(queue.pop_due(t0 + ms(15)), None);
        assert_eq!(queue.pop_due(t0 + ms(25)), Some(Work::Task(TaskId::Display2)));
    }

    #[test]
    fn test_full_queue_rejects() {
        let mut queue = EventQueue::new();
        let due = Instant::now();
        for _ in 0..QUEUE_CAPACITY {
            assert!(queue.post(Work::ResetPress { pressed_us: 0 }, due));
        }
        assert!(!queue.post(Work::GearShift(2), due));
        assert!(queue.call_at(TaskId::Gear, due).is_none());
        assert_eq!(queue.state(TaskId::Gear), TaskState::Idle);
    }

    #[test]
    fn test_inbox_drains_as_deferred_events() {
        let inbox = Inbox::default();
        inbox.post_gear();
        inbox.post_reset(42);
        inbox.post_reset(57);
        assert!(inbox.has_pending());

        let mut queue = EventQueue::new();
        let now = Instant::now();
        inbox.drain_into(&mut queue, now, || 3);
        assert!(!inbox.has_pending());
        assert_eq!(queue.pop_due(now), Some(Work::GearShift(3)));
        // One event serves both presses
        assert_eq!(queue.pop_due(now), Some(Work::ResetPress { pressed_us: 42 }));
        assert_eq!(queue.pop_due(now), None);
    }

    #[test]
    fn test_full_reset_ring_keeps_oldest() {
        let inbox = Inbox::default();
        for us in 0..(INBOX_DEPTH as u64 + 4) {
            inbox.post_reset(100 + us);
        }
        let mut queue = EventQueue::new();
        let now = Instant::now();
        inbox.drain_into(&mut queue, now, || 1);
        assert_eq!(queue.pop_due(now), Some(Work::ResetPress { pressed_us: 100 }));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_event_scheduling_serves_edges() {
        let config = BikeConfig {
            gear_debounce: Duration::ZERO,
            ..BikeConfig::default()
        };
        let timer = SysTimer::start();
        let scheduler = EventScheduling::new(&config, timer).unwrap();
        let tasks = Arc::new(TaskSet::new(
            &config,
            timer,
            Box::new(SimulatedSensor::default()),
            Box::new(LogDisplay),
        ));
        scheduler.attach(&tasks);

        thread::scope(|s| {
            s.spawn(|| scheduler.start(&tasks));
            while scheduler.state() != RunState::Running {
                thread::yield_now();
            }
            thread::sleep(ms(20));
            tasks.gear_device().on_joystick_up();
            tasks.reset_device().on_fall();
            // The Speed task occupies the dispatcher for the first 200 ms.
            thread::sleep(ms(300));
            scheduler.stop();
        });

        assert_eq!(scheduler.state(), RunState::Stopped);
        assert_eq!(tasks.current_gear(), config.min_gear + 1);
        assert_eq!(tasks.speedometer().reset_count(), 1);
        assert_eq!(tasks.reset_device().pending(), 0);
    }

    fn racing_setup() -> (BikeConfig, EventScheduling, Arc<TaskSet>) {
        let config = BikeConfig {
            gear_debounce: Duration::ZERO,
            reset_debounce: Duration::ZERO,
            ..BikeConfig::default()
        };
        let timer = SysTimer::start();
        let scheduler = EventScheduling::new(&config, timer).unwrap();
        let tasks = Arc::new(TaskSet::new(
            &config,
            timer,
            Box::new(SimulatedSensor::default()),
            Box::new(LogDisplay),
        ));
        scheduler.attach(&tasks);
        (config, scheduler, tasks)
    }

    #[test]
    fn test_racing_joystick_lines_settle_on_device_gear() {
        let (config, scheduler, tasks) = racing_setup();

        thread::scope(|s| {
            s.spawn(|| scheduler.start(&tasks));
            while scheduler.state() != RunState::Running {
                thread::yield_now();
            }
            // Edges land while the Speed task holds the dispatcher.
            thread::scope(|lines| {
                lines.spawn(|| {
                    for _ in 0..500 {
                        tasks.gear_device().on_joystick_up();
                        core::hint::spin_loop();
                    }
                });
                lines.spawn(|| {
                    for _ in 0..300 {
                        tasks.gear_device().on_joystick_down();
                        core::hint::spin_loop();
                    }
                });
            });
            // Longest task plus a few dispatcher passes
            thread::sleep(ms(500));
            scheduler.stop();
        });

        let device = tasks.gear_device().current_gear();
        assert!((config.min_gear..=config.max_gear).contains(&device));
        assert_eq!(tasks.current_gear(), device);
        assert_eq!(tasks.speedometer().gear(), device);
    }

    #[test]
    fn test_racing_reset_edges_all_served() {
        let (_config, scheduler, tasks) = racing_setup();

        thread::scope(|s| {
            s.spawn(|| scheduler.start(&tasks));
            while scheduler.state() != RunState::Running {
                thread::yield_now();
            }
            thread::scope(|lines| {
                for _ in 0..2 {
                    lines.spawn(|| {
                        for _ in 0..100 {
                            tasks.reset_device().on_fall();
                        }
                    });
                }
            });
            thread::sleep(ms(500));
            scheduler.stop();
        });

        assert_eq!(tasks.reset_device().presses(), 200);
        assert_eq!(tasks.speedometer().reset_count(), 200);
        assert_eq!(tasks.reset_device().pending(), 0);
    }
}

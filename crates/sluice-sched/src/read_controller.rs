//! Read controller.
//!
//! One thread polls the download entities: the shared pool (high priority)
//! and dedicated downloaders (normal). Each iteration runs at most one
//! entity's `do_processing`; the class checked first alternates between
//! iterations. When a pass makes no progress the thread sleeps on the
//! event waiter until woken or the idle timeout runs out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::{Direction, EventWaiter, LiveSettings};

use crate::controller::{
    any_connections, collect_stats, dump_list, list_contains, next_ready, panic_message,
    remove_from, ControllerStats, EntityList, LoopCounters, Registered,
};
use crate::diag::IndentWriter;
use crate::entity::{EntityController, Priority, SharedEntity};

#[derive(Default)]
struct LoopState {
    next_normal: usize,
    next_high: usize,
    check_high_first: bool,
    aggressive_checks: usize,
}

pub struct ReadController {
    settings: Arc<LiveSettings>,
    waiter: Arc<EventWaiter>,
    normal: EntityList,
    high: EntityList,
    writers: Mutex<()>,
    loop_state: Mutex<LoopState>,
    counters: LoopCounters,
}

impl ReadController {
    pub fn new(settings: Arc<LiveSettings>) -> Self {
        Self {
            settings,
            waiter: Arc::new(EventWaiter::new()),
            normal: EntityList::new(),
            high: EntityList::new(),
            writers: Mutex::new(()),
            loop_state: Mutex::new(LoopState {
                check_high_first: true,
                ..LoopState::default()
            }),
            counters: LoopCounters::default(),
        }
    }

    pub fn waiter(&self) -> &Arc<EventWaiter> {
        &self.waiter
    }

    /// One scheduling step. Returns true if the loop should go round again
    /// without sleeping.
    pub fn process_once(&self) -> bool {
        let mut state = self.loop_state.lock();
        let high_first = state.check_high_first;
        state.check_high_first = !high_first;
        if high_first {
            self.do_read(&mut state, Priority::High) || self.do_read(&mut state, Priority::Normal)
        } else {
            self.do_read(&mut state, Priority::Normal) || self.do_read(&mut state, Priority::High)
        }
    }

    /// Run until `stop` is set.
    pub fn run_loop(&self, stop: &AtomicBool) {
        tracing::info!("read controller started");
        while !stop.load(Ordering::Acquire) {
            let busy = match catch_unwind(AssertUnwindSafe(|| self.process_once())) {
                Ok(busy) => busy,
                Err(payload) => {
                    tracing::error!(panic = %panic_message(&*payload), "read loop iteration panicked");
                    false
                }
            };
            if !busy {
                self.idle_wait();
            }
        }
        tracing::info!("read controller stopped");
    }

    fn idle_wait(&self) {
        let timeout = if self.has_connections() {
            self.settings.idle_sleep(Direction::Download)
        } else {
            self.settings.no_connection_sleep()
        };
        self.counters.waited();
        self.waiter.wait_for_event(timeout);
    }

    fn has_connections(&self) -> bool {
        any_connections(&[&self.high, &self.normal])
    }

    fn do_read(&self, state: &mut LoopState, priority: Priority) -> bool {
        let entity = match priority {
            Priority::High => next_ready(&self.high.snapshot(), &mut state.next_high, &self.waiter),
            Priority::Normal => {
                next_ready(&self.normal.snapshot(), &mut state.next_normal, &self.waiter)
            }
        };
        let Some(entity) = entity else {
            return false;
        };

        if entity.do_processing(&self.waiter, None) > 0 {
            self.counters.progressed();
            return true;
        }
        self.counters.stalled();

        if self.settings.aggressive(Direction::Download) {
            // Try every entity once before giving in to a sleep.
            state.aggressive_checks += 1;
            if state.aggressive_checks < self.normal.len() + self.high.len() {
                return true;
            }
            state.aggressive_checks = 0;
        }
        false
    }

    pub fn stats(&self) -> ControllerStats {
        collect_stats(&self.counters, &[&self.normal, &self.high], &self.waiter, false)
    }

    pub fn generate(&self, w: &mut IndentWriter) {
        w.println("Read Controller");
        w.indent();
        dump_list(w, "normal", &self.normal);
        dump_list(w, "priority", &self.high);
        w.exdent();
    }

    pub fn entities(&self, priority: Priority) -> Arc<Vec<Registered>> {
        match priority {
            Priority::Normal => self.normal.snapshot(),
            Priority::High => self.high.snapshot(),
        }
    }
}

impl EntityController for ReadController {
    fn add_entity(&self, entity: SharedEntity, partition_id: Option<u32>) {
        {
            let _writer = self.writers.lock();
            let list = match entity.priority() {
                Priority::High => &self.high,
                Priority::Normal => &self.normal,
            };
            list.push(Registered {
                entity,
                partition_id,
            });
        }
        self.waiter.event_occurred();
    }

    fn remove_entity(&self, entity: &SharedEntity) -> bool {
        let _writer = self.writers.lock();
        let list = match entity.priority() {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
        };
        let found = remove_from(list, entity);
        if !found {
            tracing::warn!(entity = %entity.describe(), "read entity not found");
        }
        found
    }

    fn entity_count(&self) -> usize {
        self.normal.len() + self.high.len()
    }
}

impl ReadController {
    pub fn contains(&self, entity: &SharedEntity) -> bool {
        list_contains(&self.normal, entity) || list_contains(&self.high, entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_support::ScriptedEntity as Scripted;

    fn controller() -> (ReadController, Arc<LiveSettings>) {
        let settings = Arc::new(LiveSettings::default());
        (ReadController::new(settings.clone()), settings)
    }

    #[test]
    fn classes_alternate_first_pick() {
        let (c, _) = controller();
        let high = Scripted::new(Priority::High, 10);
        let normal = Scripted::new(Priority::Normal, 10);
        c.add_entity(high.clone(), None);
        c.add_entity(normal.clone(), None);

        for _ in 0..4 {
            assert!(c.process_once());
        }
        assert_eq!(high.calls(), 2);
        assert_eq!(normal.calls(), 2);
    }

    #[test]
    fn round_robin_within_class() {
        let (c, _) = controller();
        let entities: Vec<_> = (0..3).map(|_| Scripted::new(Priority::Normal, 1)).collect();
        for e in &entities {
            c.add_entity(e.clone(), None);
        }
        for _ in 0..6 {
            c.process_once();
        }
        for e in &entities {
            assert_eq!(e.calls(), 2);
        }
    }

    #[test]
    fn unready_entities_are_skipped() {
        let (c, _) = controller();
        let idle = Scripted::new(Priority::Normal, 1);
        idle.set_ready(false);
        let busy = Scripted::new(Priority::Normal, 1);
        c.add_entity(idle.clone(), None);
        c.add_entity(busy.clone(), None);
        c.process_once();
        c.process_once();
        assert_eq!(idle.calls(), 0);
        assert_eq!(busy.calls(), 2);
    }

    #[test]
    fn no_progress_reports_idle() {
        let (c, _) = controller();
        let stuck = Scripted::new(Priority::High, 0);
        c.add_entity(stuck.clone(), None);
        assert!(!c.process_once());
        let stats = c.stats();
        assert_eq!(stats.non_progress_count, 1);
        assert_eq!(stats.progress_count, 0);
    }

    #[test]
    fn aggressive_mode_retries_before_sleeping() {
        let (c, settings) = controller();
        settings.set_aggressive(Direction::Download, true);
        let a = Scripted::new(Priority::Normal, 0);
        let b = Scripted::new(Priority::Normal, 0);
        c.add_entity(a, None);
        c.add_entity(b, None);
        assert!(c.process_once());
        assert!(!c.process_once());
    }

    #[test]
    fn remove_entity_reports_presence() {
        let (c, _) = controller();
        let e: SharedEntity = Scripted::new(Priority::Normal, 1);
        c.add_entity(e.clone(), Some(3));
        assert!(c.contains(&e));
        assert!(c.remove_entity(&e));
        assert!(!c.remove_entity(&e));
        assert_eq!(c.entity_count(), 0);
    }

    #[test]
    fn adding_entity_wakes_waiter() {
        let (c, _) = controller();
        c.add_entity(Scripted::new(Priority::Normal, 1), None);
        assert!(c.waiter().wait_for_event(Duration::from_millis(0)));
    }

    #[test]
    fn panicking_entity_does_not_stop_loop() {
        let (c, _) = controller();
        let bad = Scripted::new(Priority::High, 5);
        bad.panics.store(true, Ordering::Relaxed);
        let good = Scripted::new(Priority::Normal, 5);
        c.add_entity(bad.clone(), None);
        c.add_entity(good.clone(), None);

        let c = Arc::new(c);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let c = c.clone();
            let stop = stop.clone();
            std::thread::spawn(move || c.run_loop(&stop))
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while good.calls() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::Release);
        c.waiter().event_occurred();
        handle.join().unwrap();
        assert!(bad.calls() >= 1);
        assert!(good.calls() >= 3);
    }

    #[test]
    fn dump_lists_classes() {
        let (c, _) = controller();
        c.add_entity(Scripted::new(Priority::High, 1), Some(9));
        let mut w = IndentWriter::new();
        c.generate(&mut w);
        let text = w.finish();
        assert!(text.starts_with("Read Controller\n"));
        assert!(text.contains("normal - 0"));
        assert!(text.contains("priority - 1"));
        assert!(text.contains("[partition 9] scripted High"));
    }
}

use std::collections::HashSet;

use makejobs::{
    Config, Console, JobFlags, JobState, MemoryGraph, Scheduler, SharedBuffer, TokenCoordinator,
};
use nix::sys::signal::{killpg, Signal};

fn scheduler(graph: MemoryGraph, config: Config) -> (Scheduler<MemoryGraph>, SharedBuffer) {
    let buf = SharedBuffer::default();
    let tokens = TokenCoordinator::local(config.max_jobs);
    let s = Scheduler::with_tokens(graph, config, tokens)
        .with_console(Console::new(Box::new(buf.clone())));
    (s, buf)
}

fn assert_table_sane(s: &Scheduler<MemoryGraph>) {
    let table = s.table();
    assert!(table.len() <= table.max_jobs());
    assert_eq!(table.len() >= table.max_jobs(), table.tokens().marked_full());

    let running: HashSet<_> = table.running().iter().map(|j| j.target()).collect();
    assert_eq!(running.len(), table.len());
    assert!(table.stopped().all(|j| !running.contains(&j.target())));
}

#[test]
fn never_more_than_max_jobs() {
    let _lock = makejobs::test_lock();
    let mut g = MemoryGraph::new();
    for i in 0..6 {
        g.rule(&format!("t{}", i), [format!("sleep 0.0{}", i + 1)]);
    }
    let config = Config {
        max_jobs: 2,
        ..Config::default()
    };
    let (mut s, _) = scheduler(g, config);

    let mut peak = 0;
    loop {
        while !s.is_full() {
            match makejobs::Graph::next_ready(s.graph_mut()) {
                Some(t) => {
                    s.make(t).unwrap();
                    assert_table_sane(&s);
                }
                None => break,
            }
        }
        peak = peak.max(s.table().len());
        if s.is_empty().unwrap() {
            break;
        }
        s.step(true).unwrap();
        assert_table_sane(&s);
    }
    assert_eq!(peak, 2);
    assert_eq!(s.graph().completed().len(), 6);
    assert_eq!(s.finish().unwrap(), 0);
}

#[test]
fn stopped_job_is_parked_and_resumed() {
    let _lock = makejobs::test_lock();
    let mut g = MemoryGraph::new();
    let t = g.rule("slow", ["sleep 0.3", "echo done"]);
    let (mut s, buf) = scheduler(g, Config::default());

    s.make(t).unwrap();
    let pid = s.table().running()[0].pid().unwrap();
    killpg(pid, Signal::SIGSTOP).unwrap();
    s.catch_children(true).unwrap();
    assert_eq!(s.table().len(), 0);
    assert_eq!(s.table().stopped_len(), 1);
    assert!(buf
        .contents()
        .contains(&format!("*** Stopped -- signal {}", Signal::SIGSTOP as i32)));

    s.restart_queued().unwrap();
    assert_eq!(s.table().len(), 1);
    assert_eq!(s.table().stopped_len(), 0);
    assert!(buf.contents().contains("*** Continued\n"));

    s.wait().unwrap();
    assert_eq!(s.graph().completed(), [t]);
    assert!(buf.contents().ends_with("done\n"));
    assert_eq!(s.finish().unwrap(), 0);
}

#[test]
fn queued_job_resumes_after_a_stop() {
    let _lock = makejobs::test_lock();
    let mut g = MemoryGraph::new();
    let first = g.rule("first", ["sleep 0.1"]);
    let second = g.rule("second", ["sleep 0.3", "echo second"]);
    let (mut s, buf) = scheduler(g, Config::default());

    assert_eq!(s.make(first).unwrap(), JobState::Running);
    assert_eq!(s.make(second).unwrap(), JobState::Stopped);

    // Reaping the first job starts the queued one.
    s.catch_children(true).unwrap();
    assert_eq!(s.table().len(), 1);
    let job = &s.table().running()[0];
    assert_eq!(job.target(), second);
    assert!(!job.flags().contains(JobFlags::RESTART));

    let pid = job.pid().unwrap();
    killpg(pid, Signal::SIGSTOP).unwrap();
    s.catch_children(true).unwrap();
    assert_eq!(s.table().len(), 0);
    assert_eq!(s.table().stopped_len(), 1);
    assert!(!s.table().tokens().marked_full());

    s.restart_queued().unwrap();
    assert_eq!(s.table().len(), 1);
    assert_eq!(s.table().running()[0].pid(), Some(pid));
    assert_table_sane(&s);

    s.wait().unwrap();
    assert_eq!(s.graph().completed(), [first, second]);
    assert!(buf.contents().contains("*** Continued\n"));
    assert!(buf.contents().ends_with("second\n"));
    assert_eq!(s.finish().unwrap(), 0);
}

#[test]
fn abort_all_kills_running_jobs() {
    let _lock = makejobs::test_lock();
    let mut g = MemoryGraph::new();
    let t = g.rule("forever", ["sleep 30"]);
    let (mut s, _) = scheduler(g, Config::default());

    s.make(t).unwrap();
    assert_eq!(s.table().len(), 1);
    s.abort_all();
    assert!(s.table().is_empty());
    assert_eq!(s.aborting(), Some(makejobs::Abort::Error));
    assert!(s.graph().completed().is_empty());
}

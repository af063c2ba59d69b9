use fiberjobs::{Counter, FiberJob, JobPriority, JobSystem, JobSystemError, WorkerRoster};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn test_shutdown_during_job_execution() {
    let job_system = JobSystem::with_roster(WorkerRoster::single()).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    // Submit multiple jobs that take some time
    for _ in 0..10 {
        let finished = finished.clone();
        job_system
            .run(JobPriority::Medium, move |_| {
                std::thread::sleep(Duration::from_millis(10));
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    // Shutdown drains the queued jobs before the workers exit
    let result = job_system.shutdown();
    assert!(result.is_ok(), "Shutdown should succeed after jobs complete");
    assert_eq!(finished.load(Ordering::SeqCst), 10);
}

#[test]
fn test_shutdown_with_parked_fibers() {
    let job_system = JobSystem::with_roster(WorkerRoster::single()).unwrap();
    let never = Counter::new(0);
    let done = Counter::new(0);
    let resumed = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<_> = JobPriority::ALL
        .into_iter()
        .map(|priority| {
            let (never, resumed) = (never.clone(), resumed.clone());
            FiberJob::with_priority(done.clone(), priority, move |ctx| {
                ctx.await_counter(&never, 1);
                resumed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    job_system.run_jobs(jobs).unwrap();
    assert!(!job_system.wait_for_counter_timeout(&done, 1, Duration::from_millis(50)));

    // Parked fibers are dropped rather than waited on
    job_system.shutdown().expect("Shutdown failed");
    assert_eq!(resumed.load(Ordering::SeqCst), 0);
    assert_eq!(done.value(), 0);

    // The counter is still usable afterwards
    never.increment();
    assert_eq!(never.value(), 1);
}

#[test]
fn test_shutdown_resumes_fiber_released_by_other_bucket() {
    let job_system = JobSystem::with_roster(WorkerRoster::single()).unwrap();
    let gate = Counter::new(0);
    let done = Counter::new(0);

    let waiting_gate = gate.clone();
    let releasing_gate = gate.clone();
    job_system
        .run_jobs([
            FiberJob::with_priority(done.clone(), JobPriority::High, move |ctx| {
                ctx.await_counter(&waiting_gate, 1);
            }),
            FiberJob::with_priority(Counter::default(), JobPriority::Low, move |_| {
                std::thread::sleep(Duration::from_millis(50));
                releasing_gate.increment();
            }),
        ])
        .unwrap();

    // The HIGH bucket is empty by now; the LOW job is still sleeping.
    std::thread::sleep(Duration::from_millis(10));
    job_system.shutdown().expect("Shutdown failed");

    assert_eq!(gate.value(), 1);
    assert_eq!(done.value(), 1, "fiber parked on HIGH was dropped before LOW drained");
}

#[test]
fn test_handle_outlives_system() {
    let job_system = JobSystem::with_roster(WorkerRoster::single()).unwrap();
    let handle = job_system.handle().clone();
    drop(job_system);

    assert!(!handle.is_running());
    assert!(matches!(
        handle.run_jobs([FiberJob::new(Counter::default(), |_| {})]),
        Err(JobSystemError::ShutDown)
    ));
    // Waiting does not need workers when the target is already met.
    handle.wait_for_counter(&Counter::new(3), 2);
}

#[test]
fn test_empty_shutdown() {
    let job_system = JobSystem::legacy().unwrap();
    assert_eq!(job_system.num_workers(), 16);
    job_system.shutdown().expect("Shutdown failed");
}

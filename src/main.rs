use fiberjobs::{BoxedWork, Counter, FiberJob, JobPriority, JobSystem, JobSystemConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // An optional JSON config file may be passed as the first argument.
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let loaded = std::fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|json| JobSystemConfig::from_json(&json).map_err(|err| err.to_string()));
            match loaded {
                Ok(config) => config,
                Err(err) => {
                    log::error!("could not load {path}: {err}");
                    std::process::exit(1);
                }
            }
        }
        None => JobSystemConfig::default(),
    };

    let job_system = match JobSystem::start(config) {
        Ok(job_system) => job_system,
        Err(err) => {
            log::error!("failed to start job system: {err}");
            std::process::exit(1);
        }
    };
    println!(
        "Initialized job system with {} worker threads\n",
        job_system.num_workers()
    );

    // Example 1: Simple job execution
    println!("Example 1: Simple job execution");
    let counter = job_system
        .run(JobPriority::Medium, |ctx| {
            println!("  Hello from fiber job {}!", ctx.job_id());
        })
        .expect("submit failed");
    job_system.wait_for_counter(&counter, 1);
    println!("  Job completed\n");

    // Example 2: Parallel jobs on the HIGH bucket
    println!("Example 2: Parallel computation");
    let sum = Arc::new(AtomicUsize::new(0));
    let num_jobs = 256;

    let start = Instant::now();
    let works: Vec<BoxedWork> = (0..num_jobs)
        .map(|i| {
            let sum_clone = sum.clone();
            Box::new(move |_: &fiberjobs::FiberContext<'_>| {
                sum_clone.fetch_add(i, Ordering::SeqCst);
            }) as BoxedWork
        })
        .collect();
    let counter = job_system
        .run_multiple(JobPriority::High, works)
        .expect("submit failed");
    job_system.wait_for_counter(&counter, num_jobs as u64);

    let expected_sum: usize = (0..num_jobs).sum();
    println!("  Executed {} jobs in {:?}", num_jobs, start.elapsed());
    println!(
        "  Sum result: {} (expected: {})\n",
        sum.load(Ordering::SeqCst),
        expected_sum
    );

    // Example 3: Fibers waiting on a shared counter
    println!("Example 3: Suspending fibers");
    let stage = Counter::new(1);
    let done = Counter::new(0);
    let jobs: Vec<_> = [(2, JobPriority::High), (3, JobPriority::Low)]
        .into_iter()
        .map(|(target, priority)| {
            let stage = stage.clone();
            FiberJob::with_priority(done.clone(), priority, move |ctx| {
                stage.increment();
                ctx.await_counter(&stage, target);
                println!("  {priority} fiber resumed at stage {}", stage.value());
            })
        })
        .collect();
    job_system.run_jobs(jobs).expect("submit failed");
    job_system.wait_for_counter(&done, 2);
    println!("  Both fibers finished\n");

    // Shutdown the system
    println!("Shutting down job system...");
    match job_system.shutdown() {
        Ok(()) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
}

// Discovery latency benchmark
// Times whole discovery calls (fork, scrub, run, grants, teardown) for
// blocks needing zero, one and two grants.
// Target: p50 < 5ms, p95 < 20ms

use addrprobe::{DiscoveryService, SandboxConfig};
use std::time::{Duration, Instant};

const ITERATIONS: usize = 200;
const WARMUP_ITERATIONS: usize = 20;
const P50_BUDGET: Duration = Duration::from_millis(5);
const P95_BUDGET: Duration = Duration::from_millis(20);

const SCENARIOS: &[(&str, &[u8], usize)] = &[
    // mov eax, ebx
    ("register only", &[0x89, 0xd8], 0),
    // mov [rax], eax
    ("guarded region grant", &[0x89, 0x00], 1),
    // mov [rax], eax ; mov [r11 + r12], eax
    ("guard plus fresh mapping", &[0x89, 0x00, 0x43, 0x89, 0x04, 0x23], 2),
];

fn percentile(sorted: &[Duration], fraction: f64) -> Duration {
    let index = ((sorted.len() as f64 * fraction) as usize).min(sorted.len() - 1);
    sorted[index]
}

/// Time `code` and return a failure description, if any.
fn run_scenario(service: &DiscoveryService, name: &str, code: &[u8], grants: usize) -> Option<String> {
    for _ in 0..WARMUP_ITERATIONS {
        let _ = service.discover(code);
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let result = service.discover(code);
        samples.push(start.elapsed());
        match result {
            Ok(addrs) if addrs.accessed_blocks.len() == grants => {}
            Ok(addrs) => {
                return Some(format!(
                    "expected {} blocks, got {:x?}",
                    grants, addrs.accessed_blocks
                ))
            }
            Err(e) => return Some(format!("call failed: {}", e)),
        }
    }
    samples.sort();

    let p50 = percentile(&samples, 0.50);
    let p95 = percentile(&samples, 0.95);
    println!(
        "{:<26} p50 {:>10?}  p95 {:>10?}  p99 {:>10?}  max {:>10?}",
        name,
        p50,
        p95,
        percentile(&samples, 0.99),
        samples[samples.len() - 1]
    );

    if p50 >= P50_BUDGET || p95 >= P95_BUDGET {
        Some(format!("p50={:?} p95={:?} over budget", p50, p95))
    } else {
        None
    }
}

fn main() {
    println!("=== addrprobe discovery latency ===");
    println!("{} calls per scenario after {} warmup calls\n", ITERATIONS, WARMUP_ITERATIONS);

    let service = match DiscoveryService::new(SandboxConfig::default()) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Cannot start discovery service: {}", e);
            std::process::exit(1);
        }
    };

    let failures: Vec<String> = SCENARIOS
        .iter()
        .filter_map(|&(name, code, grants)| {
            run_scenario(&service, name, code, grants).map(|reason| format!("{}: {}", name, reason))
        })
        .collect();

    println!("\n{}", service.metrics().export_prometheus());

    if failures.is_empty() {
        println!("all {} scenarios within budget", SCENARIOS.len());
    } else {
        for failure in &failures {
            println!("FAIL {}", failure);
        }
        std::process::exit(1);
    }
}

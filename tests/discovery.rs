//! End-to-end discovery through the traced isolated context.
//!
//! Every test forks and traces a real child; they need a Linux x86-64 host
//! that permits ptrace of one's own children.

mod common;

use addrprobe::config::types::{
    AccessWindow, CodePlacement, RegisterPriming, TimeoutLimit, DEFAULT_CODE_LOCATION,
    RANDOMIZED_CODE_RANGE,
};
use addrprobe::arch::TASK_SIZE;
use addrprobe::{
    discover_accessed_addresses, AccessedAddrs, CancelToken, DiscoveryError, DiscoveryService,
    SandboxConfig,
};
use common::*;
use rand::Rng;
use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn service(config: SandboxConfig) -> DiscoveryService {
    init_logging();
    DiscoveryService::new(config).unwrap()
}

fn discover(code: &[u8]) -> AccessedAddrs {
    service(SandboxConfig::default()).discover(code).unwrap()
}

fn assert_aligned(addrs: &AccessedAddrs) {
    assert!(addrs.block_size.is_power_of_two());
    for block in &addrs.accessed_blocks {
        assert_eq!(block % addrs.block_size, 0, "{:#x} is not block aligned", block);
    }
}

#[test]
fn test_register_only_block_touches_nothing() {
    let addrs = discover(MOV_EAX_EBX);
    assert!(addrs.accessed_blocks.is_empty());
    assert_eq!(addrs.code_location, DEFAULT_CODE_LOCATION);
}

#[test]
fn test_primed_registers_resolve_to_guard_then_fresh_block() {
    let addrs = discover(&concat(&[STORE_RAX, STORE_R11_R12]));
    assert_eq!(addrs.accessed_blocks, vec![0x10000, 0x20000]);
    assert_aligned(&addrs);
}

#[test]
fn test_absolute_stores_in_encounter_order() {
    let addrs = discover(&concat(&[&store_abs(0x20000), &store_abs(0x10000)]));
    assert_eq!(addrs.accessed_blocks, vec![0x20000, 0x10000]);
}

#[test]
fn test_same_block_reported_once() {
    let addrs = discover(&concat(&[STORE_RAX, STORE_RAX_PLUS_8]));
    assert_eq!(addrs.accessed_blocks, vec![0x10000]);
}

#[test]
fn test_loaded_register_is_dereferenced() {
    let addrs = discover(&concat(&[&mov_rax(0x1234_5678), LOAD_RAX]));
    assert_eq!(addrs.accessed_blocks, vec![0x1234_5000]);
    assert_aligned(&addrs);
}

#[test]
fn test_store_to_page_zero() {
    let result = service(SandboxConfig::default()).discover(&store_abs(0));
    match result {
        Ok(addrs) => assert_eq!(addrs.accessed_blocks, vec![0]),
        // Hosts with vm.mmap_min_addr > 0 refuse to map page zero.
        Err(DiscoveryError::UnresolvableAccess { addr, reason }) => {
            assert_eq!(addr, 0);
            assert!(reason.contains("refused"), "{}", reason);
        }
        Err(other) => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_larger_block_size_coarsens_results() {
    let config = SandboxConfig {
        block_size: Some(0x10000),
        ..SandboxConfig::default()
    };
    let addrs = service(config)
        .discover(&concat(&[&store_abs(0x12345), &store_abs(0x1fff0), &store_abs(0x24000)]))
        .unwrap();
    assert_eq!(addrs.block_size, 0x10000);
    assert_eq!(addrs.accessed_blocks, vec![0x10000, 0x20000]);
}

#[test]
fn test_distinct_priming() {
    let config = SandboxConfig {
        priming: RegisterPriming::Distinct {
            base: 0x100000,
            stride: 0x10000,
        },
        ..SandboxConfig::default()
    };
    // rax = base, rbx = base + stride
    let addrs = service(config)
        .discover(&concat(&[STORE_RAX, STORE_RBX]))
        .unwrap();
    assert_eq!(addrs.accessed_blocks, vec![0x100000, 0x110000]);
}

#[test]
fn test_fixed_placement_is_reproducible() {
    let service = service(SandboxConfig::default());
    let first = service.discover(STORE_RAX).unwrap();
    let second = service.discover(STORE_RAX).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.code_location, DEFAULT_CODE_LOCATION);
}

#[test]
fn test_randomized_placement_varies() {
    let service = service(SandboxConfig {
        placement: CodePlacement::Randomized,
        ..SandboxConfig::default()
    });
    let (start, end) = RANDOMIZED_CODE_RANGE;
    let locations: Vec<u64> = (0..4)
        .map(|_| service.discover(STORE_RAX).unwrap())
        .map(|addrs| {
            assert_eq!(addrs.accessed_blocks, vec![0x10000]);
            addrs.code_location
        })
        .collect();
    for &location in &locations {
        assert!(location >= start && location < end);
    }
    assert!(locations.iter().any(|&location| location != locations[0]));
}

#[test]
fn test_inherited_memory_is_scrubbed() {
    static MARKER: u64 = 0x5a5a_5a5a;
    let addr = &MARKER as *const u64 as u64;
    let code = concat(&[&mov_rax(addr), LOAD_RAX]);

    let addrs = discover(&code);
    assert_eq!(addrs.accessed_blocks, vec![addr & !0xfff]);

    // Without scrubbing the caller's page is still mapped and readable.
    let unscrubbed = service(SandboxConfig {
        scrub_address_space: false,
        ..SandboxConfig::default()
    })
    .discover(&code)
    .unwrap();
    assert!(unscrubbed.accessed_blocks.is_empty());
}

#[test]
fn test_segment_relative_loads_fault_next_to_guard() {
    let service = service(SandboxConfig::default());
    for code in [FS_CANARY_LOAD, GS_LOAD] {
        let addrs = service.discover(code).unwrap();
        assert_eq!(addrs.accessed_blocks, vec![0x10000]);
    }
}

#[test]
fn test_callers_stack_is_scrubbed() {
    let local = std::hint::black_box(0x5a5a_5a5a_u64);
    let addr = &local as *const u64 as u64;
    let addrs = discover(&concat(&[&mov_rax(addr), LOAD_RAX]));
    assert_eq!(addrs.accessed_blocks, vec![addr & !0xfff]);
}

#[test]
fn test_callers_thread_locals_are_scrubbed() {
    thread_local! {
        static SLOT: Cell<u64> = Cell::new(0x5a5a_5a5a);
    }
    let addr = SLOT.with(|slot| slot as *const Cell<u64> as u64);
    let addrs = discover(&concat(&[&mov_rax(addr), LOAD_RAX]));
    assert_eq!(addrs.accessed_blocks, vec![addr & !0xfff]);
}

#[test]
fn test_single_load_across_user_address_space() {
    let service = service(SandboxConfig::default());
    let page = service.host().page_size;
    let code_page = DEFAULT_CODE_LOCATION..DEFAULT_CODE_LOCATION + page;
    let low = service.host().mmap_min_addr.max(page) as f64;
    let high = TASK_SIZE as f64;
    let mut rng = rand::thread_rng();

    let mut checked = 0;
    while checked < 64 {
        // Log-uniform, so low addresses are sampled as often as high ones.
        let addr = rng.gen_range(low.ln()..high.ln()).exp() as u64 & !7;
        if code_page.contains(&addr) || addr >= TASK_SIZE {
            continue;
        }
        let addrs = service
            .discover(&concat(&[&mov_rax(addr), LOAD_RAX]))
            .unwrap_or_else(|e| panic!("load from {:#x} failed: {}", addr, e));
        assert_eq!(addrs.accessed_blocks, vec![addr & !(addrs.block_size - 1)], "{:#x}", addr);
        assert!(addrs.code_location > 0 && addrs.code_location < TASK_SIZE);
        checked += 1;
    }
}

#[test]
fn test_isolated_context_drops_inherited_descriptors() {
    let service = service(SandboxConfig {
        wall_time_limit_ms: 10_000,
        ..SandboxConfig::default()
    });
    let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
    let token = CancelToken::new();

    thread::scope(|scope| {
        let runner = scope.spawn(|| service.discover_with_cancel(SPIN, &token));
        thread::sleep(Duration::from_millis(300));

        // Only the spinning child could still hold the write end.
        nix::unistd::close(write_fd).unwrap();
        let started = Instant::now();
        let mut buf = [0u8; 1];
        assert_eq!(nix::unistd::read(read_fd, &mut buf).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));

        token.cancel();
        assert!(matches!(runner.join().unwrap(), Err(DiscoveryError::Cancelled)));
    });
    nix::unistd::close(read_fd).unwrap();
}

#[test]
fn test_address_incrementing_loop_hits_iteration_limit() {
    let config = SandboxConfig {
        max_fault_iterations: 32,
        ..SandboxConfig::default()
    };
    let service = service(config);
    let started = Instant::now();
    match service.discover(STORE_LOOP) {
        Err(DiscoveryError::Timeout {
            limit, iterations, ..
        }) => {
            assert_eq!(limit, TimeoutLimit::FaultIterations);
            assert_eq!(iterations, 32);
        }
        other => panic!("expected iteration timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    // Grants of a failed call still count.
    let snapshot = service.metrics().snapshot();
    assert_eq!(snapshot.blocks_granted, 32);
    assert_eq!(snapshot.fault_iterations, 32);
}

#[test]
fn test_spinning_block_hits_wall_clock_limit() {
    let config = SandboxConfig {
        wall_time_limit_ms: 200,
        ..SandboxConfig::default()
    };
    let service = service(config);
    let started = Instant::now();
    match service.discover(SPIN) {
        Err(DiscoveryError::Timeout { limit, elapsed, .. }) => {
            assert_eq!(limit, TimeoutLimit::WallClock);
            assert!(elapsed >= Duration::from_millis(200));
        }
        other => panic!("expected wall clock timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(service.metrics().snapshot().teardowns_completed, 1);
}

#[test]
fn test_invalid_opcode_is_execution_fault() {
    let result = service(SandboxConfig::default()).discover(UD2);
    match result {
        Err(DiscoveryError::ExecutionFault { pc, .. }) => assert_eq!(pc, Some(DEFAULT_CODE_LOCATION)),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_embedded_breakpoint_is_execution_fault() {
    let result = service(SandboxConfig::default()).discover(&concat(&[INT3, NOP]));
    assert!(matches!(result, Err(DiscoveryError::ExecutionFault { .. })));
}

#[test]
fn test_syscall_is_execution_fault() {
    let result = service(SandboxConfig::default()).discover(SYSCALL);
    match result {
        Err(DiscoveryError::ExecutionFault { reason, .. }) => {
            assert!(reason.contains("system call"), "{}", reason)
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_non_canonical_address_is_execution_fault() {
    let code = concat(&[&mov_rax(0x8000_0000_0000_0000), STORE_RAX]);
    let result = service(SandboxConfig::default()).discover(&code);
    assert!(matches!(result, Err(DiscoveryError::ExecutionFault { .. })));
}

#[test]
fn test_out_of_window_access_is_unresolvable() {
    let config = SandboxConfig {
        access_window: AccessWindow {
            start: 0,
            end: 0x100000,
        },
        ..SandboxConfig::default()
    };
    let code = concat(&[&mov_rax(0x200000), STORE_RAX]);
    match service(config).discover(&code) {
        Err(DiscoveryError::UnresolvableAccess { addr, .. }) => assert_eq!(addr, 0x200000),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_write_to_code_is_unresolvable() {
    let code = concat(&[&mov_rax(DEFAULT_CODE_LOCATION), STORE_RAX]);
    assert!(matches!(
        service(SandboxConfig::default()).discover(&code),
        Err(DiscoveryError::UnresolvableAccess { .. })
    ));
}

#[test]
fn test_grant_cap_is_unresolvable() {
    let config = SandboxConfig {
        max_granted_blocks: 2,
        ..SandboxConfig::default()
    };
    let code = concat(&[&store_abs(0x30000), &store_abs(0x40000), &store_abs(0x50000)]);
    match service(config).discover(&code) {
        Err(DiscoveryError::UnresolvableAccess { addr, .. }) => assert_eq!(addr, 0x50000),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_invalid_code_rejected() {
    let service = service(SandboxConfig::default());
    assert!(matches!(service.discover(&[]), Err(DiscoveryError::InvalidCode(_))));
    let oversize = vec![0x90; service.config().max_code_len + 1];
    assert!(matches!(
        service.discover(&oversize),
        Err(DiscoveryError::InvalidCode(_))
    ));
}

#[test]
fn test_cancel_during_call() {
    let service = service(SandboxConfig {
        wall_time_limit_ms: 10_000,
        ..SandboxConfig::default()
    });
    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        })
    };

    let started = Instant::now();
    let result = service.discover_with_cancel(SPIN, &token);
    canceller.join().unwrap();

    assert!(matches!(result, Err(DiscoveryError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    let snapshot = service.metrics().snapshot();
    assert_eq!(snapshot.teardowns_completed, 1);
    assert_eq!(snapshot.teardowns_failed, 0);
    assert_eq!(snapshot.active_calls, 0);
}

#[test]
fn test_batch_preserves_input_order() {
    let service = service(SandboxConfig::default());
    let blocks: Vec<Vec<u8>> = vec![
        MOV_EAX_EBX.to_vec(),
        STORE_RAX.to_vec(),
        UD2.to_vec(),
        store_abs(0x30000),
        concat(&[STORE_RAX, STORE_R11_R12]),
    ];
    let results = service.discover_batch(&blocks, 3, &CancelToken::new());

    assert_eq!(results.len(), 5);
    assert!(results[0].as_ref().unwrap().accessed_blocks.is_empty());
    assert_eq!(results[1].as_ref().unwrap().accessed_blocks, vec![0x10000]);
    assert!(matches!(results[2], Err(DiscoveryError::ExecutionFault { .. })));
    assert_eq!(results[3].as_ref().unwrap().accessed_blocks, vec![0x30000]);
    assert_eq!(
        results[4].as_ref().unwrap().accessed_blocks,
        vec![0x10000, 0x20000]
    );

    let snapshot = service.metrics().snapshot();
    assert_eq!(snapshot.calls_total, 5);
    assert_eq!(snapshot.teardowns_completed, 5);
}

#[test]
fn test_cancelled_batch() {
    let service = service(SandboxConfig::default());
    let token = CancelToken::new();
    token.cancel();
    let blocks = vec![STORE_RAX.to_vec(), MOV_EAX_EBX.to_vec()];
    let results = service.discover_batch(&blocks, 2, &token);
    assert!(results
        .iter()
        .all(|result| matches!(result, Err(DiscoveryError::Cancelled))));
}

#[test]
fn test_concurrent_calls_are_independent() {
    let service = Arc::new(service(SandboxConfig::default()));
    let handles: Vec<_> = (0..4u32)
        .map(|i| {
            let service = Arc::clone(&service);
            thread::spawn(move || service.discover(&store_abs(0x40000 + i * 0x10000)))
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let addrs = handle.join().unwrap().unwrap();
        assert_eq!(addrs.accessed_blocks, vec![0x40000 + i as u64 * 0x10000]);
    }
    assert_eq!(service.metrics().snapshot().calls_succeeded, 4);
}

#[test]
fn test_one_shot_entry_point() {
    init_logging();
    let addrs = discover_accessed_addresses(&concat(&[STORE_RAX, STORE_R11_R12])).unwrap();
    assert_eq!(addrs.accessed_blocks, vec![0x10000, 0x20000]);
}

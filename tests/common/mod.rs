//! Hand-encoded x86-64 instructions shared by the integration tests.

#![allow(dead_code)]

/// mov eax, ebx
pub const MOV_EAX_EBX: &[u8] = &[0x89, 0xd8];
/// mov [rax], eax
pub const STORE_RAX: &[u8] = &[0x89, 0x00];
/// mov [rax + 8], eax
pub const STORE_RAX_PLUS_8: &[u8] = &[0x89, 0x40, 0x08];
/// mov [r11 + r12], eax
pub const STORE_R11_R12: &[u8] = &[0x43, 0x89, 0x04, 0x23];
/// mov [rbx], eax
pub const STORE_RBX: &[u8] = &[0x89, 0x03];
/// mov ebx, [rax]
pub const LOAD_RAX: &[u8] = &[0x8b, 0x18];
/// mov rax, fs:[0x28] (stack-protector canary load)
pub const FS_CANARY_LOAD: &[u8] = &[0x64, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00];
/// mov rax, gs:[0x28]
pub const GS_LOAD: &[u8] = &[0x65, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00];
/// ud2
pub const UD2: &[u8] = &[0x0f, 0x0b];
/// int3
pub const INT3: &[u8] = &[0xcc];
/// nop
pub const NOP: &[u8] = &[0x90];
/// syscall
pub const SYSCALL: &[u8] = &[0x0f, 0x05];
/// jmp $
pub const SPIN: &[u8] = &[0xeb, 0xfe];
/// loop: add rax, 0x1000 ; mov [rax], ebx ; jmp loop
pub const STORE_LOOP: &[u8] = &[
    0x48, 0x05, 0x00, 0x10, 0x00, 0x00, 0x89, 0x18, 0xeb, 0xf6,
];

/// mov [disp32], eax (disp32 sign-extended, so `addr` < 2 GiB)
pub fn store_abs(addr: u32) -> Vec<u8> {
    let mut code = vec![0x89, 0x04, 0x25];
    code.extend_from_slice(&addr.to_le_bytes());
    code
}

/// mov rax, imm64
pub fn mov_rax(value: u64) -> Vec<u8> {
    let mut code = vec![0x48, 0xb8];
    code.extend_from_slice(&value.to_le_bytes());
    code
}

pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    parts.iter().flat_map(|part| part.iter().copied()).collect()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

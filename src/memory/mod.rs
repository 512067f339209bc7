//! Memory layout of the kernel and of every user address space.
//!
//! Physical memory: the kernel image and its heap live in the identity
//! region `[0, IDENTITY_AREA_SIZE)`, which is mapped one-to-one in every
//! page directory. Frames in `[FREE_PAGE_AREA_START, FREE_PAGE_AREA_END)`
//! are handed out by the free-page list.
//!
//! User virtual layout (per process):
//!
//! ```text
//! 0x0000_0000 .. IDENTITY_AREA_SIZE   kernel identity region (ring 0)
//! APP_ARGS_AREA_START .. +4M          exec args block
//! APP_AREA_START .. APP_AREA_END      loadable app areas
//! FREE_AREA_START .. FREE_AREA_END    request_mem / return_mem pool
//! STACK_AREA_START .. STACK_AREA_END  one 4M slot per thread, grows down
//! ```

pub mod page;
pub mod space;

pub const M_4K: u32 = 0x1000;
pub const M_4M: u32 = 0x40_0000;

pub const IDENTITY_AREA_SIZE: u32 = 0x0400_0000;
pub const NUM_IDENTITY_PTS: usize = (IDENTITY_AREA_SIZE / M_4M) as usize;

pub const FREE_PAGE_AREA_START: u32 = IDENTITY_AREA_SIZE;
pub const FREE_PAGE_AREA_END: u32 = 0xC000_0000;

/// Kernel heap, inside the identity region.
pub const KERNEL_HEAP_START: usize = 0x0100_0000;
pub const KERNEL_HEAP_SIZE: usize = 0x0100_0000;

pub const APP_ARGS_AREA_START: u32 = 0x0400_0000;
pub const APP_ARGS_AREA_SIZE: u32 = 0x0040_0000;

pub const APP_AREA_START: u32 = 0x0440_0000;
pub const APP_AREA_END: u32 = 0x8000_0000;

pub const FREE_AREA_START: u32 = 0x8000_0000;
pub const FREE_AREA_END: u32 = 0xB000_0000;

pub const FOS_MAX_THREADS_PER_PROC: u32 = 16;

/// Each thread's usable stack is one redzone page short of this.
pub const THREAD_STACK_SIZE: u32 = M_4M;

pub const STACK_AREA_SIZE: u32 = FOS_MAX_THREADS_PER_PROC * THREAD_STACK_SIZE;
pub const STACK_AREA_START: u32 = FREE_AREA_END;
pub const STACK_AREA_END: u32 = STACK_AREA_START + STACK_AREA_SIZE;

/// Canonical address of the userspace thread-entry trampoline. Every app
/// image must provide it there; `spawn_local_thread` starts new threads at
/// this address with the real entry in `eax`.
pub const USER_TRAMPOLINE_ADDR: u32 = APP_AREA_START;

/// Exclusive top of the stack slot owned by thread `tid`.
pub const fn thread_stack_end(tid: u32) -> u32 {
    STACK_AREA_END - tid * THREAD_STACK_SIZE
}

/// Lowest usable stack address of thread `tid`. The page below it is the
/// redzone separating it from the next thread's slot.
pub const fn thread_stack_limit(tid: u32) -> u32 {
    thread_stack_end(tid) - THREAD_STACK_SIZE + M_4K
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_slots_do_not_overlap() {
        for tid in 0..FOS_MAX_THREADS_PER_PROC {
            let end = thread_stack_end(tid);
            let limit = thread_stack_limit(tid);
            assert!(limit < end);
            assert!(end <= STACK_AREA_END);
            assert!(limit >= STACK_AREA_START);
            if tid + 1 < FOS_MAX_THREADS_PER_PROC {
                // Redzone page sits between consecutive slots.
                assert_eq!(thread_stack_end(tid + 1) + M_4K, limit);
            }
        }
    }

    #[test]
    fn user_areas_are_disjoint() {
        assert!(APP_ARGS_AREA_START + APP_ARGS_AREA_SIZE <= APP_AREA_START);
        assert!(APP_AREA_END <= FREE_AREA_START);
        assert!(FREE_AREA_END <= STACK_AREA_START);
        assert_eq!(IDENTITY_AREA_SIZE, APP_ARGS_AREA_START);
    }
}

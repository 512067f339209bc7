#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), feature(alloc_error_handler))]

extern crate alloc;

pub mod arch;
pub mod serial;
pub mod allocator;
pub mod util;
pub mod memory;
pub mod sched;
pub mod proc;
pub mod handle;
pub mod plugin;
pub mod fs;
pub mod syscall;
pub mod interrupts;

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

use fs::block::MemBlockDevice;
use fs::fat32::{file_sys::Fat32FileSys, init_fat32, Fat32Device};
use fs::FileSys;
use handle::cd::{CdHandleState, VgaDisplay};
use memory::space::{new_user_app_pd, UserApp};
use proc::{KernelState, Process, KERNEL};
use sched::thread::{Gtid, Thread};

/// Sectors of the boot ramdisk that carries the FAT32 filesystem.
const RAMDISK_SECTORS: u32 = 32 * 1024; // 16 MiB

/// Kernel entry, reached from the multiboot2 boot shim with the magic in
/// the first argument and the info pointer in the second.
#[no_mangle]
pub extern "C" fn kernel_main(mb_magic: u32, mb_info: u32) -> ! {
    serial::init();
    log_info!("FernOS kernel starting");

    interrupts::init();
    log_info!("descriptor tables and PIC ready");

    let boot_info = unsafe {
        multiboot2::BootInformation::load(mb_info as *const multiboot2::BootInformationHeader)
            .expect("bad multiboot2 info")
    };
    if mb_magic != multiboot2::MAGIC {
        panic!("not booted via multiboot2 (magic {:#x})", mb_magic);
    }

    let phys_mem_end = boot_info
        .memory_map_tag()
        .map(|tag| {
            tag.memory_areas()
                .iter()
                .map(|area| area.end_address())
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    unsafe {
        memory::page::init(phys_mem_end);
        arch::enable_paging();
        allocator::init(memory::KERNEL_HEAP_START, memory::KERNEL_HEAP_SIZE);
    }
    log_info!(
        "paging on, {} free pages, heap at {:#x}",
        memory::page::free_page_count(),
        memory::KERNEL_HEAP_START
    );

    // The root app ships as the first boot module: a flat image loaded at
    // the canonical app start (which is also the trampoline address).
    let root_app = {
        let module = boot_info
            .module_tags()
            .next()
            .expect("no root app boot module");
        let bytes = unsafe {
            core::slice::from_raw_parts(
                module.start_address() as *const u8,
                (module.end_address() - module.start_address()) as usize,
            )
        };
        let area_size = util::align_up(bytes.len() as u32, memory::M_4K) + memory::M_4M;
        UserApp::flat(memory::APP_AREA_START, bytes.to_vec(), area_size)
    };

    let mut ks = KernelState::new();

    // Root process: pid 0, fresh user space from the boot image.
    let root_pd = new_user_app_pd(&root_app, &[]).expect("loading root app image");
    let root_pid = ks.procs.reserve().expect("empty process table at boot");
    let mut root = Process::new(root_pid, None, root_pd);

    let main_tid = root.threads.reserve().expect("empty thread table at boot");
    let main_thr = Thread::new(main_tid, root_pd, root_app.entry, 0, 0, 0);
    root.main_tid = main_tid;
    root.threads.set(main_tid, main_thr);

    // Default output: a character display over the VGA text buffer.
    let display: Arc<Mutex<dyn handle::cd::CharDisplay>> = Arc::new(Mutex::new(VgaDisplay::new()));
    if let Some(h) = root.handles.reserve() {
        root.handles
            .set(h, Box::new(CdHandleState::new(root_pid, h, display)));
        root.out_handle = h;
    }

    ks.procs.set(root_pid, root);
    ks.root_pid = root_pid;
    ks.schedule_thread(Gtid::new(root_pid, main_tid));

    // Plugins: futex, pipe, filesystem over a formatted ramdisk, and the
    // keyboard event source.
    let fs = boot_file_sys();
    ks.set_plugin(plugin::PLG_FUTEX_ID, Box::new(plugin::futex::FutexPlugin::new(&ks)))
        .expect("futex plugin slot");
    ks.set_plugin(plugin::PLG_PIPE_ID, Box::new(plugin::pipe::PipePlugin))
        .expect("pipe plugin slot");
    ks.set_plugin(plugin::PLG_FS_ID, Box::new(plugin::fs::FsPlugin::new(&ks, fs)))
        .expect("fs plugin slot");
    ks.set_plugin(
        plugin::PLG_KEYBOARD_ID,
        Box::new(plugin::keyboard::KeyboardPlugin::new()),
    )
    .expect("keyboard plugin slot");

    let first_ctx = ks.curr_thread().map(|t| t.ctx);
    *KERNEL.lock() = Some(ks);

    log_info!("entering the schedule");
    match first_ctx {
        Some(ctx) => unsafe { sched::ctx::return_to_ctx(&ctx) },
        None => sched::ctx::return_to_halt_ctx(),
    }
}

/// Format the boot ramdisk and mount a FAT32 filesystem on it, seeding a
/// README at the root.
fn boot_file_sys() -> Box<dyn FileSys> {
    let mut bd = MemBlockDevice::new(RAMDISK_SECTORS);
    init_fat32(&mut bd, 0, RAMDISK_SECTORS, 2).expect("formatting boot ramdisk");

    let dev = Fat32Device::parse(Box::new(bd), 0, 0x5EED_F00D).expect("parsing boot ramdisk");
    let mut fsys = Fat32FileSys::new(dev);

    let root = fsys.root_key();
    match fsys.touch(&root, "README") {
        Ok(nk) => {
            let text = b"FernOS FAT32 volume\n";
            if let Err(e) = fsys.write(&nk, 0, text) {
                log_warn!("could not write README: {}", e);
            }
        }
        Err(e) => log_warn!("could not create README: {}", e),
    }

    Box::new(fsys)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log_error!("{}", info);
    loop {
        arch::hlt();
    }
}

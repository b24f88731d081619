//! Register offsets, bit definitions and the on-chip memory layout of the
//! ISP1760 host controller.
//!
//! All register addresses are byte offsets into the controller's register
//! window as seen by the CPU.

/// Number of transfer slots backed by one done/skip bitmap.
pub const MAX_SLOTS: usize = 32;

/// EHCI operational registers.
pub mod operational {
    pub const USBCMD: u32 = 0x020;
    pub const CONFIGFLAG: u32 = 0x060;
    pub const PORTSC1: u32 = 0x064;

    pub mod usbcmd {
        pub const RUN: u32 = 1 << 0;
        pub const RESET: u32 = 1 << 1;
    }

    pub mod configflag {
        pub const CF: u32 = 1 << 0;
    }

    pub mod portsc {
        /// Current connect status.
        pub const CCS: u32 = 1 << 0;
        /// Connect status change (write one to clear).
        pub const CSC: u32 = 1 << 1;
        pub const PR: u32 = 1 << 8;
        pub const LINE_STATUS_SHIFT: u32 = 10;
        pub const PP: u32 = 1 << 12;
    }
}

/// PTD bookkeeping registers, one set per transfer class.
pub mod ptd_maps {
    pub const ISO_DONEMAP: u32 = 0x130;
    pub const ISO_SKIPMAP: u32 = 0x134;
    pub const ISO_LASTPTD: u32 = 0x138;
    pub const INT_DONEMAP: u32 = 0x140;
    pub const INT_SKIPMAP: u32 = 0x144;
    pub const INT_LASTPTD: u32 = 0x148;
    pub const ATL_DONEMAP: u32 = 0x150;
    pub const ATL_SKIPMAP: u32 = 0x154;
    pub const ATL_LASTPTD: u32 = 0x158;
}

/// Chip configuration registers.
pub mod configuration {
    pub const HW_MODE_CONTROL: u32 = 0x300;
    pub const CHIP_ID: u32 = 0x304;
    pub const SCRATCH: u32 = 0x308;
    pub const SW_RESET: u32 = 0x30c;
    pub const BUFFER_STATUS: u32 = 0x334;
    pub const MEMORY: u32 = 0x33c;
    pub const PORT_1_CONTROL: u32 = 0x374;

    /// Value the scratch register test writes and expects to read back.
    pub const SCRATCH_PATTERN: u32 = 0x410c_0c0a;

    /// Port 1 configured for the host role.
    pub const PORT_1_HOST_MODE: u32 = 0x0080_0018;

    pub mod hw_mode {
        pub const GLOBAL_INTR_EN: u32 = 1 << 0;
        pub const ALL_ATX_RESET: u32 = 1 << 31;
    }

    pub mod sw_reset {
        pub const RESET_ALL: u32 = 1 << 0;
        pub const RESET_HC: u32 = 1 << 1;
    }

    pub mod buffer_status {
        pub const ATL_FILLED: u32 = 1 << 0;
        pub const INT_FILLED: u32 = 1 << 1;
    }
}

/// Interrupt cause, enable and per-PTD mask registers.
pub mod interrupt {
    pub const INTERRUPT: u32 = 0x310;
    pub const INTERRUPT_ENABLE: u32 = 0x314;
    pub const ISO_IRQ_MASK_OR: u32 = 0x318;
    pub const INT_IRQ_MASK_OR: u32 = 0x31c;
    pub const ATL_IRQ_MASK_OR: u32 = 0x320;
    pub const ISO_IRQ_MASK_AND: u32 = 0x324;
    pub const INT_IRQ_MASK_AND: u32 = 0x328;
    pub const ATL_IRQ_MASK_AND: u32 = 0x32c;

    pub mod cause {
        pub const INT: u32 = 1 << 7;
        pub const ATL: u32 = 1 << 8;
    }

    /// The causes this driver services.
    pub const HANDLED: u32 = cause::INT | cause::ATL;
}

/// On-chip SRAM layout.
///
/// The chip addresses its memory in 8-byte units starting at CPU offset
/// 0x400. PTD tables and payload buffers are expressed in chip units, which
/// is also what the PTD start-address field expects.
pub mod memory {
    /// CPU offset of chip address 0.
    pub const CPU_BASE: u32 = 0x400;
    /// CPU offset one past the last byte of chip memory (63 KiB).
    pub const CPU_END: u32 = 0x1_0000;

    pub const INT_PTD_BASE: u32 = 0x080;
    pub const ATL_PTD_BASE: u32 = 0x100;
    pub const PAYLOAD_BASE: u32 = 0x180;

    pub const PTD_DWORDS: usize = 8;
    pub const PTD_BYTES: usize = PTD_DWORDS * 4;
    /// Payload bytes reserved for every slot.
    pub const PAYLOAD_BYTES_PER_SLOT: usize = 1024;

    /// Convert a chip address into the CPU offset used for register access.
    #[must_use]
    pub const fn chip_to_cpu(chip_address: u32) -> u32 {
        (chip_address << 3) + CPU_BASE
    }

    /// Convert a CPU offset inside the memory window into a chip address.
    #[must_use]
    pub const fn cpu_to_chip(cpu_address: u32) -> u32 {
        (cpu_address - CPU_BASE) >> 3
    }

    /// Chip address of the payload buffer reserved for `slot`.
    #[must_use]
    pub const fn payload_address(slot: usize) -> u32 {
        PAYLOAD_BASE + ((slot * PAYLOAD_BYTES_PER_SLOT) as u32 >> 3)
    }
}

/// Fixed PTD field values.
pub mod ptd {
    /// Initial value of the per-PTD transaction error counter.
    pub const ERROR_COUNTER: u32 = 3;
    /// NAK reload (and initial NAK counter) for asynchronous PTDs.
    pub const ASYNC_NAK_RELOAD: u32 = 3;

    /// Micro-frame bitmaps of interrupt PTDs. Full and low speed endpoints
    /// are polled once every 8 ms.
    pub mod periodic {
        pub const HS_MICRO_FRAME: u32 = 0xff;
        pub const FS_MICRO_FRAME: u32 = 0x20;
        pub const HS_START_SPLIT: u32 = 0xff;
        pub const FS_START_SPLIT: u32 = 0x01;
        pub const HS_COMPLETE_SPLIT: u32 = 0x00;
        pub const FS_COMPLETE_SPLIT: u32 = 0xfe;
    }
}

/// Timing of the bring-up sequence, in milliseconds.
pub mod timing {
    pub const RESET_PULSE_MS: u32 = 50;
    pub const SW_RESET_MS: u32 = 250;
    pub const HC_RESET_MS: u32 = 100;
    pub const ATX_RESET_MS: u32 = 50;
    pub const RUN_TIMEOUT_MS: u64 = 50;
    pub const CONFIGFLAG_TIMEOUT_MS: u64 = 50;
    pub const CONNECT_TIMEOUT_MS: u64 = 10;
    pub const PORT_RESET_MS: u32 = 50;
    /// Poll interval of register waits, in microseconds.
    pub const WAIT_POLL_US: u32 = 10;
}

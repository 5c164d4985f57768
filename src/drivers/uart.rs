//! NS16550A UART Driver for QEMU virt machine
//!
//! Serial console output for boot messages and the kernel log.
//!
//! # Memory Map (QEMU virt)
//! - Base address: 0x1000_0000
//! - Byte-wide registers at byte offsets
//!
//! # Security Considerations
//! - Output only; no input parsing paths
//! - Unsafe code is minimal and well-documented
//! - Uses spinlock for thread-safe access

use core::fmt::{self, Write};

use spin::Mutex;

use crate::mm::address::MIO_BASE;

/// NS16550A register offsets
mod regs {
    /// Transmit Holding Register (write)
    pub const THR: usize = 0x00;
    /// Interrupt Enable Register
    pub const IER: usize = 0x01;
    /// FIFO Control Register (write)
    pub const FCR: usize = 0x02;
    /// Line Control Register
    pub const LCR: usize = 0x03;
    /// Line Status Register (read)
    pub const LSR: usize = 0x05;
}

/// Line Status Register bits
mod status {
    /// Transmit Holding Register empty
    pub const THRE: u8 = 1 << 5;
}

/// NS16550A UART driver
pub struct Uart {
    base: usize,
    initialized: bool,
}

impl Uart {
    /// Create a new UART instance (not yet initialized)
    pub const fn new(base: usize) -> Self {
        Self {
            base,
            initialized: false,
        }
    }

    /// Initialize the UART: interrupts off, FIFO on, 8n1.
    ///
    /// # Safety
    /// - Must only be called once
    /// - The base address must be the device window
    pub unsafe fn init(&mut self) {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        // SAFETY: the offsets are NS16550A registers inside the MMIO
        // window the QEMU virt machine places at the base address.
        unsafe {
            core::ptr::write_volatile((self.base + regs::IER) as *mut u8, 0x00);
            core::ptr::write_volatile((self.base + regs::FCR) as *mut u8, 0x01);
            core::ptr::write_volatile((self.base + regs::LCR) as *mut u8, 0x03);
        }
        self.initialized = true;
    }

    /// Write a single byte to the UART
    fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }

        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        // SAFETY: LSR is read-only status, THR is the transmit
        // register; both lie in the device window set up at init.
        unsafe {
            let lsr = (self.base + regs::LSR) as *const u8;
            let thr = (self.base + regs::THR) as *mut u8;

            // Wait for the transmitter to drain
            while core::ptr::read_volatile(lsr) & status::THRE == 0 {
                core::hint::spin_loop();
            }

            core::ptr::write_volatile(thr, byte);
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        let _ = byte;
    }

    /// Write a string to the UART
    pub fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Uart::write_str(self, s);
        Ok(())
    }
}

/// Global UART instance protected by spinlock
pub static UART: Mutex<Uart> = Mutex::new(Uart::new(MIO_BASE));

/// Print macro for kernel output
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let mut uart = $crate::drivers::uart::UART.lock();
        let _ = write!(uart, $($arg)*);
    }};
}

/// Println macro for kernel output
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::kprint!($($arg)*);
        $crate::kprint!("\n");
    }};
}

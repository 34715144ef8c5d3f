pub mod cache;
pub mod config;
pub mod core;
pub mod dram;
pub mod engine;
pub mod fifo;
pub mod fill_path;
pub mod hash;
pub mod instrument;
pub mod packet;
pub mod predictors;
pub mod prefetch;
pub mod replacement;
pub mod translate;

pub use engine::Engine;

/// A virtual or physical byte address.
#[allow(non_camel_case_types)]
pub type address = u64;

pub const BLOCK_SIZE: u64 = 64;
pub const LOG2_BLOCK_SIZE: u32 = 6;
pub const PAGE_SIZE: u64 = 4096;
pub const LOG2_PAGE_SIZE: u32 = 12;

/// Blocks per page.
pub const PAGE_BLOCKS: u64 = PAGE_SIZE / BLOCK_SIZE;

#[must_use]
pub fn block_addr(addr: address) -> address {
    addr & !(BLOCK_SIZE - 1)
}

#[must_use]
pub fn page_number(addr: address) -> u64 {
    addr >> LOG2_PAGE_SIZE
}

pub fn init_logging() {
    let mut log_builder = env_logger::Builder::new();
    log_builder.format(|buf, record| {
        use std::io::Write;
        writeln!(buf, "{}", record.args())
    });
    log_builder.parse_default_env();
    log_builder.init();
}

#[cfg(test)]
mod tests {
    use super::{block_addr, page_number};

    #[test]
    fn address_helpers() {
        assert_eq!(block_addr(0x1234), 0x1200);
        assert_eq!(block_addr(0x1240), 0x1240);
        assert_eq!(page_number(0x3456), 3);
    }
}

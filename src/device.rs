pub const SECTOR_SIZE: usize = 512;

/// Raw sector transport. Buffers are whole multiples of `SECTOR_SIZE`;
/// multi-sector calls address physically consecutive sectors starting at `lba`.
#[allow(async_fn_in_trait)]
pub trait BlockDevice {
    type Error: core::fmt::Debug;

    async fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), Self::Error>;
    async fn write_sectors(&mut self, lba: u32, buf: &[u8]) -> Result<(), Self::Error>;
    async fn flush(&mut self) -> Result<(), Self::Error>;
}

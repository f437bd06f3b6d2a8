// Two-wire (I2C-style) register bus
//
// The sensor driver only ever talks to the bus through a BusTransaction,
// which issues the stop condition when it goes out of scope. A failed or
// panicking read therefore never leaves the bus held.

/// Error types for bus transfers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("No acknowledge from device 0x{address:02X}")]
    Nack { address: u8 },

    #[error("Bus timeout")]
    Timeout,

    #[error("Bus fault: {0}")]
    Fault(String),
}

/// Register-level access to a device on a two-wire bus
pub trait RegisterBus {
    /// Issue a start condition and take the bus
    fn start(&mut self) -> Result<(), BusError>;

    /// Issue a stop condition and release the bus
    fn stop(&mut self);

    /// Write raw bytes to a device (first byte is usually the register)
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError>;

    /// Read `buf.len()` bytes starting at `register`
    fn read_mem(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<(), BusError>;
}

/// A bus held between start and stop conditions
pub struct BusTransaction<'a, B: RegisterBus + ?Sized> {
    bus: &'a mut B,
}

impl<'a, B: RegisterBus + ?Sized> BusTransaction<'a, B> {
    /// Take the bus. If the start condition fails the bus is released again.
    pub fn begin(bus: &'a mut B) -> Result<Self, BusError> {
        if let Err(e) = bus.start() {
            bus.stop();
            return Err(e);
        }
        Ok(Self { bus })
    }

    pub fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.bus.write(address, bytes)
    }

    pub fn read_mem(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.bus.read_mem(address, register, buf)
    }
}

impl<B: RegisterBus + ?Sized> Drop for BusTransaction<'_, B> {
    fn drop(&mut self) {
        self.bus.stop();
    }
}

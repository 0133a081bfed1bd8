use crate::{FramingMonitor, OW_RESET_BAUD, OW_TRANSFER_BAUD, OpContext, UartError, UartPort, UartResult};
use log::{debug, trace, warn};
use owp_onewire::{BitLink, OneWireError, bytes_to_bits};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;

/// Byte that stretches into a reset pulse at [`OW_RESET_BAUD`].
pub(crate) const UART_OW_RESET: u8 = 0xf0;
/// Reset echo of a line that never went high again.
const UART_OW_SHORTED: u8 = 0x00;
/// Byte emulating a write-0 slot at [`OW_TRANSFER_BAUD`].
pub(crate) const UART_OW_W0: u8 = 0x00;
/// Byte emulating a write-1 / read slot at [`OW_TRANSFER_BAUD`].
pub(crate) const UART_OW_W1: u8 = 0xff;

/// A passive UART to 1-Wire adapter.
///
/// Owns one serial port and serializes every transaction on it. A transaction opens the port,
/// resets the bus, runs a closure against a [`UartLink`] on a blocking worker and closes the port
/// again, whatever the outcome.
pub struct BitLinkAdapter<P> {
    name: String,
    port: Arc<Mutex<P>>,
    lock: Arc<Semaphore>,
    framing: FramingMonitor,
}

impl<P: UartPort> BitLinkAdapter<P> {
    /// Creates an adapter owning `port`.
    pub fn new(mut port: P) -> Self {
        let framing = FramingMonitor::default();
        port.observe(framing.clone());
        Self {
            name: port.name().to_owned(),
            port: Arc::new(Mutex::new(port)),
            lock: Arc::new(Semaphore::new(1)),
            framing,
        }
    }

    /// Name of the serial port.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` once [`close`](BitLinkAdapter::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock.is_closed()
    }

    /// Runs `op` as one exclusive bus transaction.
    ///
    /// Fails fast with [`OneWireError::BusIntegrity`] if a framing error was reported since the
    /// previous transaction. Waits for the adapter lock within `ctx`, then on a blocking worker
    /// opens the port and resets the bus; `op` runs only if a presence pulse was seen.
    ///
    /// The lock is held by the worker itself and released when it ends, and the port is closed
    /// on every exit path, including when the caller stops awaiting.
    ///
    /// # Errors
    /// [`OneWireError::Timeout`] if `ctx` ends while waiting or inside the transaction,
    /// [`OneWireError::NoDevicePresent`] without a presence pulse,
    /// [`OneWireError::BusIntegrity`] if the line stays low through the reset slot,
    /// [`OneWireError::Closed`] after [`close`](BitLinkAdapter::close), and any error of `op`.
    pub async fn run_exclusive<T, F>(&self, ctx: &OpContext, op: F) -> UartResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&mut UartLink<'a, P>) -> UartResult<T> + Send + 'static,
    {
        if let Some(at) = self.framing.take() {
            warn!("{}: framing error at {at:?}, refusing transaction", self.name);
            return Err(OneWireError::BusIntegrity);
        }
        let permit = ctx
            .run(self.lock.clone().acquire_owned())
            .await?
            .map_err(|_| OneWireError::Closed)?;
        let port = self.port.clone();
        let ctx = ctx.clone();
        let name = self.name.clone();
        let job = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut port = port.lock().unwrap_or_else(PoisonError::into_inner);
            let session = PortSession::open(&mut *port)?;
            let mut link = UartLink {
                port: &mut *session.0,
                ctx: &ctx,
            };
            if !link.reset()? {
                debug!("{name}: no presence pulse");
                return Err(OneWireError::NoDevicePresent);
            }
            op(&mut link)
        });
        match job.await {
            Ok(res) => res,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(OneWireError::Closed),
        }
    }

    /// Waits for the running transaction, then closes the port and refuses further ones.
    pub async fn close(&self) {
        if let Ok(_permit) = self.lock.acquire().await {
            self.lock.close();
            self.port
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .close();
            debug!("{}: adapter closed", self.name);
        }
    }
}

/// Keeps the port open for one transaction and closes it on drop.
struct PortSession<'a, P: UartPort>(&'a mut P);

impl<'a, P: UartPort> PortSession<'a, P> {
    fn open(port: &'a mut P) -> Result<Self, UartError> {
        port.open()?;
        Ok(Self(port))
    }
}

impl<P: UartPort> Drop for PortSession<'_, P> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// The 1-Wire primitives of an open passive adapter, valid for one transaction.
pub struct UartLink<'a, P> {
    port: &'a mut P,
    ctx: &'a OpContext,
}

impl<P: UartPort> UartLink<'_, P> {
    /// The context of the running transaction.
    pub fn context(&self) -> &OpContext {
        self.ctx
    }
}

impl<P: UartPort> BitLink for UartLink<'_, P> {
    type BusError = UartError;

    fn reset(&mut self) -> UartResult<bool> {
        self.port.set_baud_rate(OW_RESET_BAUD)?;
        let echo = self.port.exchange(UART_OW_RESET);
        // restore the slot speed whatever happened to the reset byte
        let restored = self.port.set_baud_rate(OW_TRANSFER_BAUD);
        let echo = echo?;
        restored?;
        trace!("reset echo {echo:#04x}");
        // a presence pulse ends well before the stop bit; low all the way is a short
        if echo == UART_OW_SHORTED {
            warn!("line held low through the reset slot");
            return Err(OneWireError::BusIntegrity);
        }
        // a responding slave truncates the pattern
        Ok(echo != UART_OW_RESET)
    }

    fn touch_bit(&mut self, bit: bool) -> UartResult<bool> {
        if self.should_stop() {
            return Err(OneWireError::Timeout);
        }
        let echo = self.port.exchange(if bit { UART_OW_W1 } else { UART_OW_W0 })?;
        Ok(echo == UART_OW_W1)
    }

    fn should_stop(&self) -> bool {
        self.ctx.is_done()
    }

    fn transmit(&mut self, data: &[u8]) -> UartResult<()> {
        let ctx = self.ctx;
        let mut sent = 0;
        for bit in bytes_to_bits(data).until(|| ctx.is_done()) {
            self.write_bit(bit)?;
            sent += 1;
        }
        if sent < data.len() * 8 {
            return Err(OneWireError::Timeout);
        }
        trace!("sent {data:02x?}");
        Ok(())
    }
}

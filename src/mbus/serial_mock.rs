//! Mock serial port implementation for testing
//!
//! This module provides a mock serial port that can be used to test
//! the M-Bus serial transport without requiring actual hardware. Reads on an
//! empty receive buffer stay pending, so a silent line surfaces as a receive
//! timeout exactly like a real adapter.

use crate::mbus::frame::{pack_frame, MBusFrame};
use crate::mbus::serial::{Parity, SerialPort};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock serial port that simulates bidirectional communication
#[derive(Clone)]
pub struct MockSerialPort {
    /// Data written to the port (outgoing)
    pub tx_buffer: Arc<Mutex<Vec<u8>>>,
    /// Data to be read from the port (incoming)
    pub rx_buffer: Arc<Mutex<VecDeque<u8>>>,
    /// Simulated errors
    pub next_error: Arc<Mutex<Option<io::Error>>>,
    /// Line settings applied through [`SerialPort`]
    pub settings: Arc<Mutex<(u32, Parity)>>,
    read_waker: Arc<Mutex<Option<Waker>>>,
}

impl Default for MockSerialPort {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSerialPort {
    pub fn new() -> Self {
        MockSerialPort {
            tx_buffer: Arc::new(Mutex::new(Vec::new())),
            rx_buffer: Arc::new(Mutex::new(VecDeque::new())),
            next_error: Arc::new(Mutex::new(None)),
            settings: Arc::new(Mutex::new((2400, Parity::Even))),
            read_waker: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue data to be read from the port
    pub fn queue_rx_data(&self, data: &[u8]) {
        lock(&self.rx_buffer).extend(data);
        if let Some(waker) = lock(&self.read_waker).take() {
            waker.wake();
        }
    }

    /// Queue an M-Bus frame response
    pub fn queue_frame(&self, frame: &MBusFrame) {
        self.queue_rx_data(&pack_frame(frame));
    }

    /// Get data that was written to the port
    pub fn get_tx_data(&self) -> Vec<u8> {
        lock(&self.tx_buffer).clone()
    }

    /// Bytes still waiting to be read
    pub fn pending_rx(&self) -> usize {
        lock(&self.rx_buffer).len()
    }

    /// Clear all buffers
    pub fn clear(&self) {
        lock(&self.tx_buffer).clear();
        lock(&self.rx_buffer).clear();
    }

    /// Set an error to be returned on the next operation
    pub fn set_next_error(&self, error: io::Error) {
        *lock(&self.next_error) = Some(error);
    }

    pub fn baud_rate(&self) -> u32 {
        lock(&self.settings).0
    }

    pub fn parity(&self) -> Parity {
        lock(&self.settings).1
    }
}

impl SerialPort for MockSerialPort {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        lock(&self.settings).0 = baud_rate;
        Ok(())
    }

    fn set_parity(&mut self, parity: Parity) -> io::Result<()> {
        lock(&self.settings).1 = parity;
        Ok(())
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(error) = lock(&self.next_error).take() {
            return Poll::Ready(Err(error));
        }

        let mut rx = lock(&self.rx_buffer);
        let available = rx.len().min(buf.remaining());
        if available == 0 {
            *lock(&self.read_waker) = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let data: Vec<u8> = rx.drain(..available).collect();
        buf.put_slice(&data);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(error) = lock(&self.next_error).take() {
            return Poll::Ready(Err(error));
        }

        lock(&self.tx_buffer).extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

//! Scriptable in-memory transport used by the session tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{PortInfo, Result, Transport, TransportError, TransportEvent};

#[derive(Default)]
struct MockState {
    ports: Vec<PortInfo>,
    /// Outcomes for upcoming `open` calls; empty queue means success.
    open_results: VecDeque<std::result::Result<(), String>>,
    /// Outcomes for upcoming `write_line` calls; empty queue means success.
    write_results: VecDeque<std::result::Result<(), String>>,
    open: bool,
    opened_with: Vec<(String, u32)>,
    written: Vec<String>,
    close_count: u32,
}

/// Test-side control surface for a [`MockTransport`].
#[derive(Clone)]
pub struct MockTransportHandle {
    state: Arc<Mutex<MockState>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransportHandle {
    pub fn set_ports(&self, ports: Vec<PortInfo>) {
        self.state.lock().unwrap().ports = ports;
    }

    /// Queue the outcome of the next `open` call.
    pub fn script_open(&self, result: std::result::Result<(), &str>) {
        self.state
            .lock()
            .unwrap()
            .open_results
            .push_back(result.map_err(|e| e.to_string()));
    }

    /// Queue the outcome of the next `write_line` call.
    pub fn script_write(&self, result: std::result::Result<(), &str>) {
        self.state
            .lock()
            .unwrap()
            .write_results
            .push_back(result.map_err(|e| e.to_string()));
    }

    /// Deliver one inbound line to the session, as the device would.
    pub fn push_line(&self, line: &str) {
        let _ = self.event_tx.send(TransportEvent::Line(line.to_string()));
    }

    pub fn push_event(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    /// Every `(path, baud)` pair passed to `open`, in order.
    pub fn open_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().opened_with.clone()
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().unwrap().close_count
    }

    /// Lines written so far, in order.
    pub fn written_lines(&self) -> Vec<String> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn clear_written(&self) {
        self.state.lock().unwrap().written.clear();
    }
}

/// In-memory [`Transport`] twin of a real serial driver.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockTransportHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MockState::default()));
        let transport = Self {
            state: state.clone(),
            event_rx: Some(event_rx),
        };
        let handle = MockTransportHandle { state, event_tx };
        (transport, handle)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.state.lock().unwrap().ports.clone())
    }

    async fn open(&mut self, path: &str, baud: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.opened_with.push((path.to_string(), baud));
        match state.open_results.pop_front() {
            Some(Err(reason)) => Err(TransportError::OpenFailed(reason)),
            _ => {
                state.open = true;
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.close_count += 1;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        match state.write_results.pop_front() {
            Some(Err(reason)) => Err(TransportError::WriteFailed(reason)),
            _ => {
                state.written.push(line.to_string());
                Ok(())
            }
        }
    }

    fn events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.event_rx
            .take()
            .expect("transport event stream already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_writes_and_scripted_failures() {
        let (mut transport, handle) = MockTransport::new();
        transport.open("COM3", 115200).await.unwrap();
        transport.write_line("get all\n").await.unwrap();

        handle.script_write(Err("pipe broken"));
        assert!(transport.write_line("get vel\n").await.is_err());
        transport.write_line("get torque\n").await.unwrap();

        assert_eq!(handle.written_lines(), vec!["get all\n", "get torque\n"]);
        assert_eq!(handle.open_calls(), vec![("COM3".to_string(), 115200)]);
    }

    #[tokio::test]
    async fn write_requires_open_port() {
        let (mut transport, _handle) = MockTransport::new();
        assert!(matches!(
            transport.write_line("get all\n").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn pushed_lines_arrive_on_event_stream() {
        let (mut transport, handle) = MockTransport::new();
        let mut events = transport.events();
        handle.push_line("OK");
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Line("OK".to_string()))
        );
    }
}

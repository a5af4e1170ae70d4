//! A simulated front-end board used in testing the crate. Every [`Mock`] session opened through a
//! [`MockConnector`] shares the state of one [`MockBoard`], so tests can script the hardware and
//! inspect the traffic after the fact.

use super::{
    Connector,
    Transport,
    TransportError,
    TransportResult,
};
use crate::core::{
    Endianness,
    RegisterAddress,
};
use kstring::KString;
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

/// Computes the value a register reads back, given everything written so far
type Responder = Box<dyn FnMut(&Registers) -> u32 + Send>;

/// The register file of a simulated board
#[derive(Debug, Clone, Default)]
pub struct Registers {
    values: HashMap<RegisterAddress, u32>,
    history: Vec<(RegisterAddress, u32)>,
}

impl Registers {
    /// Current value of `address`, zero if never written
    #[must_use]
    pub fn value(&self, address: &RegisterAddress) -> u32 {
        self.values.get(address).copied().unwrap_or_default()
    }

    /// Every value written to `address`, oldest first
    #[must_use]
    pub fn writes_to(&self, address: &RegisterAddress) -> Vec<u32> {
        self.history
            .iter()
            .filter(|(addr, _)| addr == address)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Every register write, oldest first
    #[must_use]
    pub fn history(&self) -> &[(RegisterAddress, u32)] {
        &self.history
    }
}

#[derive(Default)]
struct BoardState {
    registers: Registers,
    blocks: HashMap<KString, Vec<u8>>,
    responders: HashMap<RegisterAddress, Responder>,
    failures: HashMap<RegisterAddress, usize>,
    corrupted: HashSet<RegisterAddress>,
    missing_devices: HashSet<KString>,
    offline: bool,
    connects: usize,
    disconnects: usize,
    reads: usize,
    pings: usize,
    writes: usize,
}

impl BoardState {
    /// Consumes one injected failure for `address`, if any are left
    fn take_failure(&mut self, address: &RegisterAddress) -> bool {
        match self.failures.get_mut(address) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Shared handle to the state of one simulated board
#[derive(Clone, Default)]
pub struct MockBoard {
    state: Arc<Mutex<BoardState>>,
}

impl fmt::Debug for MockBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MockBoard")
            .field("registers", &state.registers.values.len())
            .field("offline", &state.offline)
            .field("connects", &state.connects)
            .field("disconnects", &state.disconnects)
            .finish_non_exhaustive()
    }
}

impl MockBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connector whose sessions all talk to this board
    #[must_use]
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            board: self.clone(),
        }
    }

    /// Preload a register without recording a write
    pub fn set(&self, address: &RegisterAddress, value: u32) {
        self.state().registers.values.insert(address.clone(), value);
    }

    #[must_use]
    pub fn value(&self, address: &RegisterAddress) -> u32 {
        self.state().registers.value(address)
    }

    #[must_use]
    pub fn writes_to(&self, address: &RegisterAddress) -> Vec<u32> {
        self.state().registers.writes_to(address)
    }

    /// A snapshot of the register file
    #[must_use]
    pub fn registers(&self) -> Registers {
        self.state().registers.clone()
    }

    /// Script the value `address` reads back
    pub fn respond_with<F>(&self, address: &RegisterAddress, responder: F)
    where
        F: FnMut(&Registers) -> u32 + Send + 'static,
    {
        self.state()
            .responders
            .insert(address.clone(), Box::new(responder));
    }

    /// Make the next `count` accesses of `address` fail with a transport error
    pub fn fail_next(&self, address: &RegisterAddress, count: usize) {
        self.state().failures.insert(address.clone(), count);
    }

    /// Make reads of `address` return a value different from the one stored
    pub fn corrupt_readback(&self, address: &RegisterAddress) {
        self.state().corrupted.insert(address.clone());
    }

    /// Take the whole server down (or bring it back)
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Make `device` stop answering online probes while the server stays up
    pub fn remove_device(&self, device: &str) {
        self.state().missing_devices.insert(KString::from_ref(device));
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Number of register reads attempted, failed ones included
    #[must_use]
    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// Number of register writes attempted, failed ones included
    #[must_use]
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    /// Number of online checks, failed ones included
    #[must_use]
    pub fn pings(&self) -> usize {
        self.state().pings
    }
}

/// Opens [`Mock`] sessions against a [`MockBoard`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    board: MockBoard,
}

impl Connector for MockConnector {
    type Transport = Mock;

    fn connect(&self, server: &str) -> TransportResult<Mock> {
        let mut state = self.board.state();
        if state.offline {
            return Err(TransportError::Connect {
                server: server.to_string(),
                reason: "connection refused".into(),
            });
        }
        state.connects += 1;
        Ok(Mock {
            board: self.board.clone(),
            server: KString::from_ref(server),
        })
    }
}

/// A session on a simulated board
#[derive(Debug)]
pub struct Mock {
    board: MockBoard,
    server: KString,
}

impl Mock {
    fn offline(&self, node: &str) -> TransportError {
        TransportError::Read {
            node: node.to_string(),
            reason: format!("server {} went away", self.server),
        }
    }
}

impl Transport for Mock {
    fn disconnect(&mut self) -> TransportResult<()> {
        self.board.state().disconnects += 1;
        Ok(())
    }

    fn is_online(&mut self, device: &str) -> TransportResult<bool> {
        let mut state = self.board.state();
        state.pings += 1;
        if state.offline {
            return Err(self.offline(device));
        }
        Ok(!state.missing_devices.contains(device))
    }

    fn write_block(&mut self, node: &str, data: &[u8]) -> TransportResult<()> {
        let mut state = self.board.state();
        if state.offline {
            return Err(self.offline(node));
        }
        state.blocks.insert(KString::from_ref(node), data.to_vec());
        Ok(())
    }

    fn read_block(&mut self, node: &str, len: usize) -> TransportResult<Vec<u8>> {
        let state = self.board.state();
        if state.offline {
            return Err(self.offline(node));
        }
        let mut bytes = state.blocks.get(node).cloned().unwrap_or_default();
        bytes.resize(len, 0);
        Ok(bytes)
    }

    fn write_register(
        &mut self,
        address: &RegisterAddress,
        value: u32,
        _order: Endianness,
    ) -> TransportResult<()> {
        let mut guard = self.board.state();
        let state = &mut *guard;
        state.writes += 1;
        if state.offline {
            return Err(self.offline(&address.bus));
        }
        if state.take_failure(address) {
            return Err(TransportError::Write {
                node: address.bus.to_string(),
                reason: "injected failure".into(),
            });
        }
        state.registers.values.insert(address.clone(), value);
        state.registers.history.push((address.clone(), value));
        Ok(())
    }

    fn read_register(&mut self, address: &RegisterAddress, _order: Endianness) -> TransportResult<u32> {
        let mut guard = self.board.state();
        let state = &mut *guard;
        state.reads += 1;
        if state.offline {
            return Err(self.offline(&address.bus));
        }
        if state.take_failure(address) {
            return Err(TransportError::Read {
                node: address.bus.to_string(),
                reason: "injected failure".into(),
            });
        }
        let value = match state.responders.remove(address) {
            Some(mut responder) => {
                let value = responder(&state.registers);
                state.responders.insert(address.clone(), responder);
                value
            }
            None => state.registers.value(address),
        };
        if state.corrupted.contains(address) {
            Ok(value ^ 1)
        } else {
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    fn session(board: &MockBoard) -> Mock {
        board.connector().connect("mock:4841").unwrap()
    }

    macro_rules! test_injected_failures {
        ($n:literal) => {
            paste! {
                #[test]
                fn [<test_ $n _injected_failures>]() {
                    let board = MockBoard::new();
                    let addr = RegisterAddress::new("fpga", 0x02);
                    board.set(&addr, 0xBEEF);
                    board.fail_next(&addr, $n);
                    let mut transport = session(&board);
                    for _ in 0..$n {
                        assert!(transport.read_register(&addr, Endianness::Little).is_err());
                    }
                    assert_eq!(transport.read_register(&addr, Endianness::Little).unwrap(), 0xBEEF);
                    assert_eq!(board.reads(), $n + 1);
                }
            }
        };
    }

    test_injected_failures!(0);
    test_injected_failures!(1);
    test_injected_failures!(4);

    #[test]
    fn test_write_read() {
        let board = MockBoard::new();
        let mut transport = session(&board);
        let addr = RegisterAddress::new("fpga", 0x10);
        transport
            .write_register(&addr, 0xFF, Endianness::Little)
            .unwrap();
        transport
            .write_register(&addr, 0x00, Endianness::Little)
            .unwrap();
        assert_eq!(transport.read_register(&addr, Endianness::Little).unwrap(), 0);
        assert_eq!(board.writes_to(&addr), vec![0xFF, 0x00]);
    }

    #[test]
    fn test_responder_sees_writes() {
        let board = MockBoard::new();
        let ctrl = RegisterAddress::new("fpga", 0x01);
        let status = RegisterAddress::new("fpga", 0x02);
        let watched = ctrl.clone();
        board.respond_with(&status, move |regs| regs.value(&watched) * 2);
        let mut transport = session(&board);
        transport.write_register(&ctrl, 21, Endianness::Big).unwrap();
        assert_eq!(transport.read_register(&status, Endianness::Big).unwrap(), 42);
    }

    #[test]
    fn test_corrupted_readback() {
        let board = MockBoard::new();
        let addr = RegisterAddress::new("fpga", 0x03);
        board.corrupt_readback(&addr);
        let mut transport = session(&board);
        transport.write_register(&addr, 6, Endianness::Little).unwrap();
        assert_eq!(transport.read_register(&addr, Endianness::Little).unwrap(), 7);
    }

    #[test]
    fn test_offline() {
        let board = MockBoard::new();
        let mut transport = session(&board);
        board.set_offline(true);
        assert!(board.connector().connect("mock:4841").is_err());
        assert!(transport.is_online("fpga").is_err());
        board.set_offline(false);
        board.remove_device("fpga");
        assert!(!transport.is_online("fpga").unwrap());
        assert!(transport.is_online("other").unwrap());
        assert_eq!(board.connects(), 1);
    }

    #[test]
    fn test_blocks() {
        let board = MockBoard::new();
        let mut transport = session(&board);
        transport.write_block("spi", &[1, 2, 3]).unwrap();
        assert_eq!(transport.read_block("spi", 4).unwrap(), vec![1, 2, 3, 0]);
        assert_eq!(transport.read_block("spi", 2).unwrap(), vec![1, 2]);
        assert_eq!(transport.read_block("empty", 2).unwrap(), vec![0, 0]);
    }
}

// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus server emulating a bus coupler register bank
//!
//! To avoid the master/slave terminology this module talks about a server,
//! the emulated coupler answering requests, and a client, the controller
//! polling it.

use std::{
    collections::HashMap,
    future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{debug, error};
use tokio::net::TcpListener;
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};

/// Default number of addresses in each table
pub const DEFAULT_CAPACITY: u32 = 0x1_0000;

/// Sparse register map: unwritten addresses read back as zero, addresses at
/// or beyond the capacity answer `IllegalDataAddress`
#[derive(Debug, Clone)]
pub struct RegisterBank {
    capacity: u32,
    discrete_inputs: HashMap<u16, bool>,
    coils: HashMap<u16, bool>,
    input_registers: HashMap<u16, u16>,
    holding_registers: HashMap<u16, u16>,
}

pub type SharedRegisterBank = Arc<Mutex<RegisterBank>>;

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RegisterBank {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            discrete_inputs: HashMap::new(),
            coils: HashMap::new(),
            input_registers: HashMap::new(),
            holding_registers: HashMap::new(),
        }
    }

    pub fn shared(self) -> SharedRegisterBank {
        Arc::new(Mutex::new(self))
    }

    pub fn set_discrete_input(&mut self, addr: u16, value: bool) {
        self.discrete_inputs.insert(addr, value);
    }

    pub fn set_input_registers(&mut self, addr: u16, values: &[u16]) {
        for (offset, value) in values.iter().enumerate() {
            self.input_registers
                .insert(addr.wrapping_add(offset as u16), *value);
        }
    }

    pub fn coil(&self, addr: u16) -> bool {
        self.coils.get(&addr).copied().unwrap_or(false)
    }

    pub fn holding_register(&self, addr: u16) -> u16 {
        self.holding_registers.get(&addr).copied().unwrap_or(0)
    }

    pub fn holding_registers(&self, addr: u16, count: u16) -> Vec<u16> {
        (0..count)
            .map(|offset| self.holding_register(addr.wrapping_add(offset)))
            .collect()
    }

    fn check_range(&self, addr: u16, count: usize) -> Result<(), ExceptionCode> {
        if u32::from(addr) + count as u32 > self.capacity {
            error!("SERVER: Exception::IllegalDataAddress at {addr} (+{count})");
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }

    fn read<T: Copy + Default>(
        &self,
        table: &HashMap<u16, T>,
        addr: u16,
        count: u16,
    ) -> Result<Vec<T>, ExceptionCode> {
        self.check_range(addr, count.into())?;
        Ok((0..count)
            .map(|offset| table.get(&(addr + offset)).copied().unwrap_or_default())
            .collect())
    }

    fn write_coils(&mut self, addr: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        self.check_range(addr, values.len())?;
        for (offset, value) in values.iter().enumerate() {
            self.coils.insert(addr + offset as u16, *value);
        }
        Ok(())
    }

    fn write_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        self.check_range(addr, values.len())?;
        for (offset, value) in values.iter().enumerate() {
            self.holding_registers.insert(addr + offset as u16, *value);
        }
        Ok(())
    }

    /// Answer one request against the bank
    pub fn handle(&mut self, req: Request<'_>) -> Result<Response, ExceptionCode> {
        match req {
            Request::ReadDiscreteInputs(addr, cnt) => self
                .read(&self.discrete_inputs, addr, cnt)
                .map(Response::ReadDiscreteInputs),
            Request::ReadCoils(addr, cnt) => {
                self.read(&self.coils, addr, cnt).map(Response::ReadCoils)
            }
            Request::WriteSingleCoil(addr, value) => self
                .write_coils(addr, std::slice::from_ref(&value))
                .map(|_| Response::WriteSingleCoil(addr, value)),
            Request::WriteMultipleCoils(addr, values) => self
                .write_coils(addr, &values)
                .map(|_| Response::WriteMultipleCoils(addr, values.len() as u16)),
            Request::ReadInputRegisters(addr, cnt) => self
                .read(&self.input_registers, addr, cnt)
                .map(Response::ReadInputRegisters),
            Request::ReadHoldingRegisters(addr, cnt) => self
                .read(&self.holding_registers, addr, cnt)
                .map(Response::ReadHoldingRegisters),
            Request::WriteSingleRegister(addr, value) => self
                .write_registers(addr, std::slice::from_ref(&value))
                .map(|_| Response::WriteSingleRegister(addr, value)),
            Request::WriteMultipleRegisters(addr, values) => self
                .write_registers(addr, &values)
                .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16)),
            _ => {
                error!("SERVER: Exception::IllegalFunction - Unimplemented function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }
}

/// Modbus service answering from a shared register bank
pub struct RegisterBankServer {
    bank: SharedRegisterBank,
}

impl RegisterBankServer {
    pub fn new(bank: SharedRegisterBank) -> Self {
        Self { bank }
    }

    fn bank(&self) -> MutexGuard<'_, RegisterBank> {
        self.bank.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl tokio_modbus::server::Service for RegisterBankServer {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.bank().handle(req))
    }
}

/// Serve `bank` on `listener` until the listener fails
pub async fn serve(listener: TcpListener, bank: SharedRegisterBank) -> io::Result<()> {
    let server = Server::new(listener);
    let new_service = move |_socket_addr: SocketAddr| {
        Ok(Some(RegisterBankServer::new(bank.clone())))
    };
    let on_connected = move |stream, socket_addr: SocketAddr| {
        debug!("SERVER: client connected from {socket_addr}");
        let new_service = new_service.clone();
        async move { accept_tcp_connection(stream, socket_addr, new_service) }
    };
    let on_process_error = |err| {
        error!("SERVER: {err}");
    };
    server.serve(&on_connected, on_process_error).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_unwritten_addresses_read_zero() {
        let mut bank = RegisterBank::default();
        bank.set_input_registers(10, &[7, 8]);
        let response = bank.handle(Request::ReadInputRegisters(9, 4)).unwrap();
        assert_eq!(response, Response::ReadInputRegisters(vec![0, 7, 8, 0]));
    }

    #[test]
    fn test_writes_land_in_outputs() {
        let mut bank = RegisterBank::default();
        bank.handle(Request::WriteMultipleCoils(2, Cow::Owned(vec![true, false, true])))
            .unwrap();
        assert!(bank.coil(2));
        assert!(!bank.coil(3));
        assert!(bank.coil(4));

        bank.handle(Request::WriteMultipleRegisters(2080, Cow::Owned(vec![1, 2])))
            .unwrap();
        bank.handle(Request::WriteSingleRegister(2082, 3)).unwrap();
        assert_eq!(bank.holding_registers(2080, 3), vec![1, 2, 3]);
    }

    #[test]
    fn test_out_of_range_is_an_exception() {
        let mut bank = RegisterBank::new(16);
        assert_eq!(
            bank.handle(Request::ReadInputRegisters(15, 2)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            bank.handle(Request::WriteSingleCoil(16, true)),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }
}

use std::future::Future;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::modbus::{self, ModbusTCPCodec, Operation, Request, Response, ResponseKind};
use crate::registers::{Catalog, Region};
use crate::simulator::SimulatedDevice;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("`{0}` did not resolve to any address")]
    NoAddresses(String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` timed out")]
    ConnectTimeout(String),
    #[error("not connected to the device")]
    NotConnected,
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the device did not respond to transaction {0} in time")]
    ResponseTimeout(u16),
    #[error("the device closed the connection")]
    Closed,
    #[error("response with function code {0:#04x} does not match the request")]
    UnexpectedResponse(u8),
}

/// A Modbus exception returned by the device in response to a well-formed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception(pub u8);

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let description = match self.0 {
            1 => "illegal function",
            2 => "illegal data address",
            3 => "illegal data value",
            4 => "server device failure",
            6 => "server device busy",
            _ => "device exception",
        };
        write!(f, "{description} (exception code {})", self.0)
    }
}

/// The device's answer to a request: the data, or the exception it reported.
pub type Reply<T> = Result<T, Exception>;

/// The capability the poll cycle needs from whatever talks to the heat pump.
///
/// Outer errors are transport failures; the inner [`Reply`] carries Modbus exceptions.
pub trait Transport: Send {
    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Read `count` 16-bit registers from the input or holding region.
    fn read_words(
        &mut self,
        region: Region,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Reply<Vec<u16>>, Error>> + Send;

    /// Read `count` discrete inputs or coils.
    fn read_bits(
        &mut self,
        region: Region,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Reply<Vec<bool>>, Error>> + Send;

    /// Write a single holding register, or a single coil (any non-zero value turns it on).
    fn write_single(
        &mut self,
        region: Region,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<Reply<()>, Error>> + Send;
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    #[clap(flatten)]
    how: ConnectionGroup,

    /// The modbus unit ID of the heat pump.
    #[arg(long, short = 'i', default_value = "1")]
    device_id: u8,

    /// Give up connecting to the device after this long.
    #[arg(long, default_value = "3s")]
    connect_timeout: humantime::Duration,

    /// If the modbus response isn't received in this amount of time, consider the request failed
    /// and drop the connection.
    #[arg(long, default_value = "3s")]
    read_timeout: humantime::Duration,
}

#[derive(clap::Parser, Clone)]
#[group(required = true)]
pub struct ConnectionGroup {
    /// Connect to the heat pump over Modbus TCP (e.g. `192.168.1.50:502`).
    #[arg(long)]
    tcp: Option<String>,
    /// Talk to a simulated heat pump instead.
    #[arg(long)]
    demo: bool,
}

impl Args {
    pub fn open(&self, catalog: &Catalog) -> Link {
        match &self.how.tcp {
            Some(address) if !self.how.demo => Link::Tcp(TcpTransport::new(
                address.clone(),
                self.device_id,
                *self.connect_timeout,
                *self.read_timeout,
            )),
            _ => Link::Demo(SimulatedDevice::demo(catalog)),
        }
    }
}

pub struct TcpTransport {
    address: String,
    device_id: u8,
    connect_timeout: Duration,
    read_timeout: Duration,
    framed: Option<Framed<TcpStream, ModbusTCPCodec>>,
    next_transaction_id: u16,
}

impl TcpTransport {
    pub fn new(address: String, device_id: u8, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self { address, device_id, connect_timeout, read_timeout, framed: None, next_transaction_id: 0 }
    }

    async fn open_stream(&self) -> Result<TcpStream, Error> {
        let address = &self.address;
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.clone()))?;
        let mut last_error = None;
        for socket_address in addresses {
            info!(message = "connecting...", %socket_address);
            match TcpStream::connect(socket_address).await {
                Ok(socket) => {
                    if let Err(error) = socket.set_nodelay(true) {
                        warn!(message = "could not set nodelay", %error);
                    }
                    return Ok(socket);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => Error::Connect(e, address.clone()),
            None => Error::NoAddresses(address.clone()),
        })
    }

    async fn transact(&mut self, operation: Operation) -> Result<Response, Error> {
        let Some(framed) = self.framed.as_mut() else {
            return Err(Error::NotConnected);
        };
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = transaction_id.wrapping_add(1);
        let request = Request { device_id: self.device_id, transaction_id, operation };
        let result = exchange(framed, &request, self.read_timeout).await;
        if let Err(error) = &result {
            // The stream may be mid-frame or the peer gone; either way it's unusable now.
            debug!(message = "dropping the connection", %error);
            self.framed = None;
        }
        let response = result?;
        let expected = operation.function_code() as u8;
        if response.function_code & 0x7F != expected {
            return Err(Error::UnexpectedResponse(response.function_code));
        }
        Ok(response)
    }
}

async fn exchange(
    framed: &mut Framed<TcpStream, ModbusTCPCodec>,
    request: &Request,
    timeout: Duration,
) -> Result<Response, Error> {
    framed.send(request).await.map_err(Error::Send)?;
    let deadline = Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, framed.next())
            .await
            .map_err(|_| Error::ResponseTimeout(request.transaction_id))?;
        let response = next.ok_or(Error::Closed)?.map_err(Error::Receive)?;
        if response.transaction_id != request.transaction_id {
            debug!(
                message = "discarding response to an earlier request",
                transaction_id = response.transaction_id,
                expected = request.transaction_id
            );
            continue;
        }
        return Ok(response);
    }
}

impl Transport for TcpTransport {
    fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.framed = None;
        let socket = tokio::time::timeout(self.connect_timeout, self.open_stream())
            .await
            .map_err(|_| Error::ConnectTimeout(self.address.clone()))??;
        self.framed = Some(Framed::new(socket, ModbusTCPCodec {}));
        Ok(())
    }

    async fn read_words(&mut self, region: Region, address: u16, count: u16) -> Result<Reply<Vec<u16>>, Error> {
        let response = self.transact(Operation::Read { region, address, count }).await?;
        match response.kind {
            ResponseKind::ErrorCode(code) => Ok(Err(Exception(code))),
            ResponseKind::Words { values } if values.len() == usize::from(count) => Ok(Ok(values)),
            _ => Err(Error::UnexpectedResponse(response.function_code)),
        }
    }

    async fn read_bits(&mut self, region: Region, address: u16, count: u16) -> Result<Reply<Vec<bool>>, Error> {
        let response = self.transact(Operation::Read { region, address, count }).await?;
        match response.kind {
            ResponseKind::ErrorCode(code) => Ok(Err(Exception(code))),
            ResponseKind::Bits { bytes } => modbus::unpack_bits(&bytes, count)
                .map(Ok)
                .ok_or(Error::UnexpectedResponse(response.function_code)),
            _ => Err(Error::UnexpectedResponse(response.function_code)),
        }
    }

    async fn write_single(&mut self, region: Region, address: u16, value: u16) -> Result<Reply<()>, Error> {
        let operation = match region {
            Region::Coil => Operation::SetCoil { address, value: value != 0 },
            _ => Operation::SetHolding { address, value },
        };
        let response = self.transact(operation).await?;
        match response.kind {
            ResponseKind::ErrorCode(code) => Ok(Err(Exception(code))),
            ResponseKind::Written { .. } => Ok(Ok(())),
            _ => Err(Error::UnexpectedResponse(response.function_code)),
        }
    }
}

/// Whichever transport the command line selected.
pub enum Link {
    Tcp(TcpTransport),
    Demo(SimulatedDevice),
}

impl Transport for Link {
    fn is_connected(&self) -> bool {
        match self {
            Link::Tcp(t) => t.is_connected(),
            Link::Demo(d) => d.is_connected(),
        }
    }

    async fn connect(&mut self) -> Result<(), Error> {
        match self {
            Link::Tcp(t) => t.connect().await,
            Link::Demo(d) => d.connect().await,
        }
    }

    async fn read_words(&mut self, region: Region, address: u16, count: u16) -> Result<Reply<Vec<u16>>, Error> {
        match self {
            Link::Tcp(t) => t.read_words(region, address, count).await,
            Link::Demo(d) => d.read_words(region, address, count).await,
        }
    }

    async fn read_bits(&mut self, region: Region, address: u16, count: u16) -> Result<Reply<Vec<bool>>, Error> {
        match self {
            Link::Tcp(t) => t.read_bits(region, address, count).await,
            Link::Demo(d) => d.read_bits(region, address, count).await,
        }
    }

    async fn write_single(&mut self, region: Region, address: u16, value: u16) -> Result<Reply<()>, Error> {
        match self {
            Link::Tcp(t) => t.write_single(region, address, value).await,
            Link::Demo(d) => d.write_single(region, address, value).await,
        }
    }
}

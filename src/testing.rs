//! 测试辅助工具模块
//! Test utilities: a scriptable in-memory driver.
//!
//! [`MockServer`] plays the database. Connect and reset progress through a
//! scripted sequence of poll statuses, and every command receives either the
//! next queued [`Response`] or the answer of a handler closure. Counters and a
//! log of sent commands let tests assert what the client actually did.
//!
//! Sockets are fake descriptor numbers by default, which is all
//! [`ManualReactor`](crate::reactor::ManualReactor) needs. With
//! [`MockServer::use_socket_pairs`] every connection gets a real Unix socket
//! pair instead, and the mock writes to the peer end whenever the client
//! should see the socket become readable; that drives the tokio reactor.

use crate::{
    config::ConnectParams,
    driver::{
        Command, ConnStatus, Connector, Driver, DriverError, DriverErrorKind, Param, PollStatus,
        QueryResult, TransactionStatus,
    },
};
use bytes::Bytes;
use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, Read, Write},
    net::Shutdown,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
    rc::Rc,
};
use tracing::{debug, trace};

const FIRST_FAKE_FD: RawFd = 1000;

/// How the mock server answers one command.
#[derive(Debug, Clone)]
pub enum Response {
    Rows(QueryResult),
    Error(DriverError),
    /// The server goes away while the command is in flight.
    DropConnection,
    /// The command never completes.
    Hang,
}

impl Response {
    /// A successful result with a single text column.
    pub fn rows<S: AsRef<str>>(column: &str, values: &[S]) -> Self {
        Response::Rows(QueryResult {
            columns: vec![column.to_string()],
            rows: values
                .iter()
                .map(|v| vec![Some(Bytes::copy_from_slice(v.as_ref().as_bytes()))])
                .collect(),
            command_tag: format!("SELECT {}", values.len()),
        })
    }

    /// A successful result carrying only a completion tag.
    pub fn tag(tag: impl Into<String>) -> Self {
        Response::Rows(QueryResult {
            command_tag: tag.into(),
            ..QueryResult::default()
        })
    }
}

type Handler = Rc<dyn Fn(&Command) -> Response>;

struct ServerState {
    next_fd: RawFd,
    next_session: u64,
    killed_below: u64,
    socket_pairs: bool,
    connect_script: Vec<PollStatus>,
    reset_script: Vec<PollStatus>,
    fail_connect_start: Option<DriverError>,
    fail_reset_start: Option<DriverError>,
    responses: VecDeque<Response>,
    handler: Option<Handler>,
    busy_rounds: usize,
    sent: Vec<Command>,
    connects: usize,
    resets: usize,
    closed_sockets: usize,
}

/// A scriptable stand-in for a database server.
/// 可编排脚本的数据库服务器替身。
pub struct MockServer {
    state: RefCell<ServerState>,
}

impl MockServer {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(ServerState {
                next_fd: FIRST_FAKE_FD,
                next_session: 1,
                killed_below: 0,
                socket_pairs: false,
                connect_script: vec![PollStatus::Writing, PollStatus::Reading, PollStatus::Ok],
                reset_script: vec![PollStatus::Writing, PollStatus::Reading, PollStatus::Ok],
                fail_connect_start: None,
                fail_reset_start: None,
                responses: VecDeque::new(),
                handler: None,
                busy_rounds: 0,
                sent: Vec::new(),
                connects: 0,
                resets: 0,
                closed_sockets: 0,
            }),
        })
    }

    pub fn connector(self: &Rc<Self>) -> Rc<MockConnector> {
        Rc::new(MockConnector {
            server: self.clone(),
        })
    }

    /// Gives every new connection a real Unix socket pair.
    pub fn use_socket_pairs(&self, enabled: bool) {
        self.state.borrow_mut().socket_pairs = enabled;
    }

    /// Poll statuses returned by successive `connect_poll` calls. The last
    /// status repeats once the script is exhausted.
    pub fn set_connect_script(&self, script: Vec<PollStatus>) {
        self.state.borrow_mut().connect_script = script;
    }

    /// Poll statuses returned by successive `reset_poll` calls.
    pub fn set_reset_script(&self, script: Vec<PollStatus>) {
        self.state.borrow_mut().reset_script = script;
    }

    pub fn fail_connect_start(&self, err: Option<DriverError>) {
        self.state.borrow_mut().fail_connect_start = err;
    }

    pub fn fail_reset_start(&self, err: Option<DriverError>) {
        self.state.borrow_mut().fail_reset_start = err;
    }

    /// Queues the answer to the next command. Queued responses win over the
    /// handler.
    pub fn push_response(&self, response: Response) {
        self.state.borrow_mut().responses.push_back(response);
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Command) -> Response + 'static,
    {
        self.state.borrow_mut().handler = Some(Rc::new(handler));
    }

    /// Number of `consume_input` calls a command needs before it completes.
    pub fn set_busy_rounds(&self, rounds: usize) {
        self.state.borrow_mut().busy_rounds = rounds;
    }

    /// Breaks every connection opened so far, as a server restart would.
    pub fn kill_connections(&self) {
        let mut state = self.state.borrow_mut();
        state.killed_below = state.next_session;
        debug!(killed_below = state.killed_below, "Mock server dropped all sessions");
    }

    /// Every command sent so far, in order.
    pub fn sent(&self) -> Vec<Command> {
        self.state.borrow().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.borrow().sent.len()
    }

    pub fn connects(&self) -> usize {
        self.state.borrow().connects
    }

    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    pub fn closed_sockets(&self) -> usize {
        self.state.borrow().closed_sockets
    }

    fn open_session(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        let id = state.next_session;
        state.next_session += 1;
        id
    }

    fn is_alive(&self, session: u64) -> bool {
        session >= self.state.borrow().killed_below
    }

    fn open_socket(&self) -> io::Result<Socket> {
        let mut state = self.state.borrow_mut();
        if state.socket_pairs {
            let (local, peer) = UnixStream::pair()?;
            local.set_nonblocking(true)?;
            peer.set_nonblocking(true)?;
            Ok(Socket::Pair { local, peer })
        } else {
            let fd = state.next_fd;
            state.next_fd += 1;
            Ok(Socket::Fake(fd))
        }
    }

    fn respond(&self, command: &Command) -> Response {
        let (queued, handler) = {
            let mut state = self.state.borrow_mut();
            state.sent.push(command.clone());
            (state.responses.pop_front(), state.handler.clone())
        };
        match (queued, handler) {
            (Some(response), _) => response,
            (None, Some(handler)) => handler(command),
            (None, None) => Response::tag(default_tag(command)),
        }
    }
}

fn default_tag(command: &Command) -> String {
    match command {
        Command::Exec { sql, .. } => sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase(),
        Command::Prepare { .. } => "PREPARE".to_string(),
        Command::ExecPrepared { .. } => "EXECUTE".to_string(),
    }
}

/// Opens [`MockDriver`] connections against a [`MockServer`].
pub struct MockConnector {
    server: Rc<MockServer>,
}

impl MockConnector {
    fn open(&self) -> Result<MockDriver, DriverError> {
        let (script, failure) = {
            let mut state = self.server.state.borrow_mut();
            state.connects += 1;
            (state.connect_script.clone(), state.fail_connect_start.clone())
        };
        if let Some(err) = failure {
            return Err(err);
        }
        let socket = self.server.open_socket().map_err(io_error)?;
        Ok(MockDriver {
            server: self.server.clone(),
            session: self.server.open_session(),
            socket,
            retired: Vec::new(),
            status: ConnStatus::Started,
            script: script.into(),
            transaction: TransactionStatus::Idle,
            in_flight: None,
            error_message: String::new(),
        })
    }
}

impl Connector for MockConnector {
    fn connect_start(&self, _params: &ConnectParams) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(self.open()?))
    }

    fn connect(&self, _params: &ConnectParams) -> Result<Box<dyn Driver>, DriverError> {
        let mut driver = self.open()?;
        driver.run_script();
        Ok(Box::new(driver))
    }
}

enum Socket {
    Fake(RawFd),
    Pair { local: UnixStream, peer: UnixStream },
    Closed,
}

impl Socket {
    fn fd(&self) -> RawFd {
        match self {
            Socket::Fake(fd) => *fd,
            Socket::Pair { local, .. } => local.as_raw_fd(),
            Socket::Closed => -1,
        }
    }

    /// Makes the local end readable.
    fn signal(&mut self) {
        if let Socket::Pair { peer, .. } = self {
            let _ = peer.write_all(&[1]);
        }
    }

    fn drain(&mut self) {
        if let Socket::Pair { local, .. } = self {
            let mut buf = [0u8; 64];
            while matches!(local.read(&mut buf), Ok(n) if n > 0) {}
        }
    }
}

struct InFlight {
    response: Response,
    busy_left: usize,
}

/// An in-memory driver connection.
/// 内存中的驱动连接。
pub struct MockDriver {
    server: Rc<MockServer>,
    session: u64,
    socket: Socket,
    // Closed pairs stay open until the driver is dropped, so their
    // descriptor numbers are not reused while a reactor may still hold them.
    retired: Vec<UnixStream>,
    status: ConnStatus,
    script: VecDeque<PollStatus>,
    transaction: TransactionStatus,
    in_flight: Option<InFlight>,
    error_message: String,
}

impl MockDriver {
    fn alive(&self) -> bool {
        !matches!(self.socket, Socket::Closed)
            && self.status == ConnStatus::Ok
            && self.server.is_alive(self.session)
    }

    fn lost(&mut self, message: &str) -> DriverError {
        self.status = ConnStatus::Bad;
        self.error_message = message.to_string();
        DriverError::connection_bad(message)
    }

    fn retire_socket(&mut self) {
        if let Socket::Pair { local, peer } = std::mem::replace(&mut self.socket, Socket::Closed) {
            let _ = local.shutdown(Shutdown::Both);
            self.retired.push(local);
            self.retired.push(peer);
        }
    }

    fn step(&mut self) -> PollStatus {
        self.socket.drain();
        let status = match self.script.len() {
            0 => PollStatus::Ok,
            1 => self.script[0],
            _ => self.script.pop_front().unwrap_or(PollStatus::Ok),
        };
        match status {
            PollStatus::Ok => {
                self.status = ConnStatus::Ok;
                self.error_message.clear();
            }
            PollStatus::Failed => {
                self.status = ConnStatus::Bad;
                self.error_message = "could not connect to server: Connection refused".to_string();
            }
            PollStatus::Reading => self.socket.signal(),
            PollStatus::Writing => {}
        }
        trace!(session = self.session, ?status, "Mock poll");
        status
    }

    fn run_script(&mut self) -> PollStatus {
        loop {
            let status = self.step();
            if matches!(status, PollStatus::Ok | PollStatus::Failed) {
                return status;
            }
        }
    }

    fn begin_reset(&mut self) -> Result<(), DriverError> {
        let (script, failure) = {
            let mut state = self.server.state.borrow_mut();
            state.resets += 1;
            (state.reset_script.clone(), state.fail_reset_start.clone())
        };
        if let Some(err) = failure {
            return Err(err);
        }
        self.retire_socket();
        self.socket = self.server.open_socket().map_err(io_error)?;
        self.session = self.server.open_session();
        self.status = ConnStatus::Started;
        self.transaction = TransactionStatus::Idle;
        self.in_flight = None;
        self.script = script.into();
        Ok(())
    }

    fn start(&mut self, command: Command) -> Result<(), DriverError> {
        if !self.alive() {
            return Err(self.lost("no connection to the server"));
        }
        if self.in_flight.is_some() {
            return Err(DriverError::new(
                DriverErrorKind::Usage,
                "another command is already in progress",
            ));
        }
        let response = self.server.respond(&command);
        let busy_left = self.server.state.borrow().busy_rounds;
        if !matches!(response, Response::Hang) {
            self.socket.signal();
        }
        self.transaction = match (&command, self.transaction) {
            (Command::Exec { sql, .. }, TransactionStatus::Idle) if is_begin(sql) => {
                TransactionStatus::InTransaction
            }
            (_, status) => status,
        };
        self.in_flight = Some(InFlight { response, busy_left });
        trace!(session = self.session, command = command.kind(), "Mock command started");
        self.apply_end(&command);
        Ok(())
    }

    fn apply_end(&mut self, command: &Command) {
        if let Command::Exec { sql, .. } = command {
            let word = sql.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
            if matches!(word.as_str(), "COMMIT" | "ROLLBACK" | "END") {
                self.transaction = TransactionStatus::Idle;
            }
        }
    }

    fn run(&mut self, command: Command) -> Result<QueryResult, DriverError> {
        self.start(command)?;
        self.block()?;
        self.get_last_result()
    }
}

fn is_begin(sql: &str) -> bool {
    matches!(
        sql.split_whitespace().next().map(str::to_ascii_uppercase).as_deref(),
        Some("BEGIN" | "START")
    )
}

fn io_error(err: io::Error) -> DriverError {
    DriverError::connection_bad(format!("could not create socket: {err}"))
}

impl Driver for MockDriver {
    fn connect_poll(&mut self) -> PollStatus {
        self.step()
    }

    fn reset_start(&mut self) -> Result<(), DriverError> {
        self.begin_reset()
    }

    fn reset_poll(&mut self) -> PollStatus {
        self.step()
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        self.begin_reset()?;
        match self.run_script() {
            PollStatus::Ok => Ok(()),
            _ => Err(DriverError::connection_bad(self.error_message.clone())),
        }
    }

    fn status(&self) -> ConnStatus {
        if self.status == ConnStatus::Ok && !self.server.is_alive(self.session) {
            return ConnStatus::Bad;
        }
        self.status
    }

    fn transaction_status(&self) -> TransactionStatus {
        if self.in_flight.is_some() {
            return TransactionStatus::Active;
        }
        self.transaction
    }

    fn error_message(&self) -> String {
        self.error_message.clone()
    }

    fn socket(&self) -> RawFd {
        self.socket.fd()
    }

    fn send_query(&mut self, sql: &str, params: &[Param]) -> Result<(), DriverError> {
        self.start(Command::exec(sql, params.to_vec()))
    }

    fn send_prepare(&mut self, name: &str, sql: &str) -> Result<(), DriverError> {
        self.start(Command::prepare(name, sql))
    }

    fn send_query_prepared(&mut self, name: &str, params: &[Param]) -> Result<(), DriverError> {
        self.start(Command::exec_prepared(name, params.to_vec()))
    }

    fn consume_input(&mut self) -> Result<(), DriverError> {
        self.socket.drain();
        if !self.alive() {
            self.in_flight = None;
            return Err(self.lost("server closed the connection unexpectedly"));
        }
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Ok(());
        };
        match in_flight.response {
            Response::DropConnection => {
                self.in_flight = None;
                Err(self.lost("server closed the connection unexpectedly"))
            }
            Response::Hang => Ok(()),
            _ => {
                if in_flight.busy_left > 0 {
                    in_flight.busy_left -= 1;
                    self.socket.signal();
                }
                Ok(())
            }
        }
    }

    fn is_busy(&self) -> bool {
        match &self.in_flight {
            Some(InFlight {
                response: Response::Hang,
                ..
            }) => true,
            Some(in_flight) => in_flight.busy_left > 0,
            None => false,
        }
    }

    fn get_last_result(&mut self) -> Result<QueryResult, DriverError> {
        let Some(in_flight) = self.in_flight.take() else {
            return Err(DriverError::new(DriverErrorKind::Usage, "no command in progress"));
        };
        match in_flight.response {
            Response::Rows(result) => Ok(result),
            Response::Error(err) => {
                if self.transaction == TransactionStatus::InTransaction {
                    self.transaction = TransactionStatus::InError;
                }
                self.error_message = err.message.clone();
                Err(err)
            }
            Response::DropConnection => Err(self.lost("server closed the connection unexpectedly")),
            Response::Hang => Err(DriverError::new(
                DriverErrorKind::Usage,
                "command has not completed",
            )),
        }
    }

    fn block(&mut self) -> Result<(), DriverError> {
        match self.in_flight.as_mut() {
            Some(InFlight {
                response: Response::Hang,
                ..
            }) => Err(DriverError::new(
                DriverErrorKind::Usage,
                "command would block forever",
            )),
            Some(in_flight) => {
                in_flight.busy_left = 0;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn exec(&mut self, sql: &str, params: &[Param]) -> Result<QueryResult, DriverError> {
        self.run(Command::exec(sql, params.to_vec()))
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Result<QueryResult, DriverError> {
        self.run(Command::prepare(name, sql))
    }

    fn exec_prepared(&mut self, name: &str, params: &[Param]) -> Result<QueryResult, DriverError> {
        self.run(Command::exec_prepared(name, params.to_vec()))
    }

    fn close_socket(&mut self) {
        debug!(session = self.session, fd = self.socket.fd(), "Mock socket closed");
        self.server.state.borrow_mut().closed_sockets += 1;
        self.in_flight = None;
        self.retire_socket();
        self.status = ConnStatus::Bad;
    }

    fn finish(&mut self) {
        self.in_flight = None;
        self.retire_socket();
        self.status = ConnStatus::Bad;
    }
}

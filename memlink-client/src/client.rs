//! # Synchronous Client API
//!
//! Purpose: Route each operation to the server owning its key, run it over
//! that server's connection and turn the reply into a typed result.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides hashing, framing and connection
//!    bookkeeping behind one method per operation.
//! 2. **Borrow-Friendly API**: Keys and values are `&[u8]` and reach the
//!    socket without being copied.
//! 3. **Fail Over, Not Around**: Transport failures move a request to the
//!    next candidate server; semantic replies (`NOT_FOUND`, `EXISTS`) are
//!    returned as-is and never retried.
//! 4. **Explicit Reply Shape**: No-reply and buffered modes return
//!    `Reply::NotRequested` / `Reply::Buffered` instead of a fabricated value.
//!
//! ## Request Flow
//!
//! ```text
//! validate key -> digest(group key) -> candidates -> encode
//!     -> purge owed replies -> write -> read -> typed result
//!                 |                              |
//!                 +-- transport error: next candidate (per retry policy)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use memlink_common::{
    validate_key, CodecError, Command, Item, Protocol, Response, ServerStatus, Verb,
};
use memlink_hash::{Distributor, HashKit};
use tracing::{debug, warn};

use crate::codec;
use crate::config::{ClientConfig, ServerConfig};
use crate::connection::{
    Connection, ConnectionSnapshot, ConnectionState, Connector, FailurePolicy, TcpConnector,
    Timeouts,
};
use crate::error::{ClientError, ClientResult, ConfigError};
use crate::server::ServerList;

/// Outcome of an operation that may not wait for the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    /// The server answered.
    Value(T),
    /// Sent without asking for a reply.
    NotRequested,
    /// Queued in the write buffer; the reply is drained later.
    Buffered,
}

impl<T> Reply<T> {
    /// The server's answer, if one was read.
    pub fn value(self) -> Option<T> {
        match self {
            Reply::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Reply::Value(_))
    }
}

/// Client over a list of independent servers.
///
/// Every call takes `&mut self`: a client owns its connections and is driven
/// by one thread at a time.
pub struct Client {
    config: ClientConfig,
    servers: ServerList,
    distributor: Distributor,
    connector: Box<dyn Connector>,
}

impl Client {
    /// Creates a client using the configured hash algorithm.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let kit = HashKit::new(config.hash)?;
        Self::with_hash_kit(config, kit)
    }

    /// Creates a client with an explicit hash kit, e.g. a custom function.
    pub fn with_hash_kit(config: ClientConfig, kit: HashKit) -> Result<Self, ConfigError> {
        config.validate()?;

        let timeouts = Timeouts {
            connect: Some(config.connect_timeout()),
            read: Some(config.read_timeout()),
            write: Some(config.write_timeout()),
        };
        let policy = FailurePolicy {
            limit: config.server_failure_limit,
            window: config.failure_window(),
            retry_timeout: config.retry_timeout(),
        };
        let mut servers = ServerList::new(timeouts, policy);
        for server in &config.servers {
            servers.add(server.clone())?;
        }

        Ok(Client {
            distributor: Distributor::new(config.distribution, kit),
            config,
            servers,
            connector: Box::new(TcpConnector),
        })
    }

    /// Replaces the transport factory.
    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Box::new(connector);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ---- keyed operations ------------------------------------------------

    /// Fetches an item. Returns `Ok(None)` on a miss.
    pub fn get(&mut self, key: &[u8]) -> ClientResult<Option<Item>> {
        self.get_by_key(key, key)
    }

    pub fn get_by_key(&mut self, group_key: &[u8], key: &[u8]) -> ClientResult<Option<Item>> {
        self.retrieve(group_key, Command::new(Verb::Get, key))
    }

    /// Fetches an item together with its cas token.
    pub fn gets(&mut self, key: &[u8]) -> ClientResult<Option<Item>> {
        self.gets_by_key(key, key)
    }

    pub fn gets_by_key(&mut self, group_key: &[u8], key: &[u8]) -> ClientResult<Option<Item>> {
        self.retrieve(group_key, Command::new(Verb::Gets, key))
    }

    pub fn set(&mut self, key: &[u8], value: &[u8], flags: u32, expiration: u32) -> ClientResult<Reply<()>> {
        self.set_by_key(key, key, value, flags, expiration)
    }

    pub fn set_by_key(
        &mut self,
        group_key: &[u8],
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
    ) -> ClientResult<Reply<()>> {
        self.store(group_key, Command::store(Verb::Set, key, value, flags, expiration))
    }

    /// Stores only if the key does not exist (`NOT_STORED` otherwise).
    pub fn add(&mut self, key: &[u8], value: &[u8], flags: u32, expiration: u32) -> ClientResult<Reply<()>> {
        self.add_by_key(key, key, value, flags, expiration)
    }

    pub fn add_by_key(
        &mut self,
        group_key: &[u8],
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
    ) -> ClientResult<Reply<()>> {
        self.store(group_key, Command::store(Verb::Add, key, value, flags, expiration))
    }

    /// Stores only if the key exists.
    pub fn replace(&mut self, key: &[u8], value: &[u8], flags: u32, expiration: u32) -> ClientResult<Reply<()>> {
        self.replace_by_key(key, key, value, flags, expiration)
    }

    pub fn replace_by_key(
        &mut self,
        group_key: &[u8],
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
    ) -> ClientResult<Reply<()>> {
        self.store(group_key, Command::store(Verb::Replace, key, value, flags, expiration))
    }

    pub fn append(&mut self, key: &[u8], value: &[u8]) -> ClientResult<Reply<()>> {
        self.append_by_key(key, key, value)
    }

    pub fn append_by_key(&mut self, group_key: &[u8], key: &[u8], value: &[u8]) -> ClientResult<Reply<()>> {
        self.store(group_key, Command::store(Verb::Append, key, value, 0, 0))
    }

    pub fn prepend(&mut self, key: &[u8], value: &[u8]) -> ClientResult<Reply<()>> {
        self.prepend_by_key(key, key, value)
    }

    pub fn prepend_by_key(&mut self, group_key: &[u8], key: &[u8], value: &[u8]) -> ClientResult<Reply<()>> {
        self.store(group_key, Command::store(Verb::Prepend, key, value, 0, 0))
    }

    /// Stores only if the item's cas token still equals `cas`.
    pub fn cas(
        &mut self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> ClientResult<Reply<()>> {
        self.cas_by_key(key, key, value, flags, expiration, cas)
    }

    pub fn cas_by_key(
        &mut self,
        group_key: &[u8],
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> ClientResult<Reply<()>> {
        let command = Command::store(Verb::Cas, key, value, flags, expiration).with_cas(cas);
        self.store(group_key, command)
    }

    pub fn delete(&mut self, key: &[u8]) -> ClientResult<Reply<()>> {
        self.delete_by_key(key, key)
    }

    pub fn delete_by_key(&mut self, group_key: &[u8], key: &[u8]) -> ClientResult<Reply<()>> {
        let command = Command::new(Verb::Delete, key).with_no_reply(self.config.no_reply);
        typed(self.execute(group_key, command)?, |response| match response {
            Response::Deleted => Ok(()),
            other => Err(other),
        })
    }

    /// Updates an item's expiration without fetching it.
    pub fn touch(&mut self, key: &[u8], expiration: u32) -> ClientResult<Reply<()>> {
        self.touch_by_key(key, key, expiration)
    }

    pub fn touch_by_key(&mut self, group_key: &[u8], key: &[u8], expiration: u32) -> ClientResult<Reply<()>> {
        let command = Command::new(Verb::Touch, key)
            .with_expiration(expiration)
            .with_no_reply(self.config.no_reply);
        typed(self.execute(group_key, command)?, |response| match response {
            Response::Touched => Ok(()),
            other => Err(other),
        })
    }

    /// Adds `offset` to a numeric item and returns the new value.
    pub fn increment(&mut self, key: &[u8], offset: u64) -> ClientResult<Reply<u64>> {
        self.increment_by_key(key, key, offset)
    }

    pub fn increment_by_key(&mut self, group_key: &[u8], key: &[u8], offset: u64) -> ClientResult<Reply<u64>> {
        self.count(group_key, Command::counter(Verb::Increment, key, offset))
    }

    /// Subtracts `offset`, clamping at zero on the server.
    pub fn decrement(&mut self, key: &[u8], offset: u64) -> ClientResult<Reply<u64>> {
        self.decrement_by_key(key, key, offset)
    }

    pub fn decrement_by_key(&mut self, group_key: &[u8], key: &[u8], offset: u64) -> ClientResult<Reply<u64>> {
        self.count(group_key, Command::counter(Verb::Decrement, key, offset))
    }

    /// Increments, seeding a missing item with `initial`. Binary protocol only.
    pub fn increment_with_initial(
        &mut self,
        key: &[u8],
        offset: u64,
        initial: u64,
        expiration: u32,
    ) -> ClientResult<Reply<u64>> {
        self.increment_with_initial_by_key(key, key, offset, initial, expiration)
    }

    pub fn increment_with_initial_by_key(
        &mut self,
        group_key: &[u8],
        key: &[u8],
        offset: u64,
        initial: u64,
        expiration: u32,
    ) -> ClientResult<Reply<u64>> {
        let command = Command::counter(Verb::Increment, key, offset).with_initial(initial, expiration);
        self.count(group_key, command)
    }

    /// Decrements, seeding a missing item with `initial`. Binary protocol only.
    pub fn decrement_with_initial(
        &mut self,
        key: &[u8],
        offset: u64,
        initial: u64,
        expiration: u32,
    ) -> ClientResult<Reply<u64>> {
        self.decrement_with_initial_by_key(key, key, offset, initial, expiration)
    }

    pub fn decrement_with_initial_by_key(
        &mut self,
        group_key: &[u8],
        key: &[u8],
        offset: u64,
        initial: u64,
        expiration: u32,
    ) -> ClientResult<Reply<u64>> {
        let command = Command::counter(Verb::Decrement, key, offset).with_initial(initial, expiration);
        self.count(group_key, command)
    }

    /// Fetches several keys with one request per server.
    ///
    /// Missing keys are absent from the map. When a server's batch fails at
    /// the transport level its keys are fetched one by one, which lets them
    /// fail over like single gets.
    pub fn get_multi(&mut self, keys: &[&[u8]]) -> ClientResult<HashMap<Vec<u8>, Item>> {
        for key in keys {
            self.check_key(key)?;
        }

        let mut groups: BTreeMap<usize, Vec<&[u8]>> = BTreeMap::new();
        for &key in keys {
            let index = self.primary(key)?;
            groups.entry(index).or_default().push(key);
        }

        let mut found = HashMap::with_capacity(keys.len());
        for (index, group) in groups {
            match self.fetch_batch(index, &group, &mut found) {
                Ok(()) => {}
                Err(err) if err.is_retryable() => {
                    debug!(server = %self.label(index), keys = group.len(), error = %err, "batch failed, fetching keys singly");
                    for key in group {
                        if let Some(item) = self.get(key)? {
                            found.insert(key.to_vec(), item);
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(found)
    }

    /// Fetches several keys from the one server owning `group_key`.
    pub fn get_multi_by_key(&mut self, group_key: &[u8], keys: &[&[u8]]) -> ClientResult<HashMap<Vec<u8>, Item>> {
        for key in keys {
            self.check_key(key)?;
        }
        let index = self.primary(group_key)?;
        let mut found = HashMap::with_capacity(keys.len());
        self.fetch_batch(index, keys, &mut found)?;
        Ok(found)
    }

    /// Routes `command` by `group_key` (its own key when empty) and returns
    /// the raw reply.
    ///
    /// # Errors
    /// Key and configuration errors are returned before any I/O. Transport
    /// errors are returned once every permitted attempt has failed.
    pub fn execute(&mut self, group_key: &[u8], mut command: Command<'_>) -> ClientResult<Reply<Response>> {
        self.check(&command)?;
        let protocol = self.config.protocol;
        command.no_reply = command.no_reply && codec::supports_no_reply(protocol, command.verb);

        let group_key = if group_key.is_empty() { command.key } else { group_key };
        let (digest, candidates) = self.candidates(group_key);
        if candidates.is_empty() {
            return Err(ClientError::NoServersAvailable);
        }

        let verb = command.verb;
        let attempts = if verb.is_read() {
            self.config.max_attempts.max(self.config.replicas + 1)
        } else if self.config.retry_writes && verb.is_idempotent() {
            self.config.max_attempts
        } else {
            1
        };

        let mut last_error = ClientError::NoServersAvailable;
        for (attempt, &index) in candidates.iter().take(attempts.max(1)).enumerate() {
            if attempt > 0 {
                debug!(server = %self.label(index), attempt, ?verb, "redistributing request");
            }
            match self.run(index, &command) {
                Ok(reply) => {
                    let succeeded = !matches!(reply, Reply::Value(Response::Error(_)));
                    if succeeded && self.config.replicas > 0 && (verb.is_storage() || verb == Verb::Delete) {
                        self.mirror(digest, index, &command);
                    }
                    return Ok(reply);
                }
                Err(err) if err.is_retryable() => {
                    warn!(server = %self.label(index), error = %err, ?verb, "request failed");
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }

    // ---- server-wide operations -----------------------------------------

    /// Invalidates every item on every server after `delay` seconds.
    ///
    /// All servers are attempted; the first failure is returned.
    pub fn flush_all(&mut self, delay: u32) -> ClientResult<()> {
        let no_reply = self.config.no_reply && codec::supports_no_reply(self.config.protocol, Verb::FlushAll);
        let command = Command::keyless(Verb::FlushAll)
            .with_expiration(delay)
            .with_no_reply(no_reply);

        let mut first_error = None;
        for index in 0..self.servers.len() {
            let result = self.run(index, &command).and_then(|reply| {
                typed(reply, |response| match response {
                    Response::Ok => Ok(()),
                    other => Err(other),
                })
            });
            if let Err(err) = result {
                warn!(server = %self.label(index), error = %err, "flush_all failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Version string of each server, in server order.
    pub fn versions(&mut self) -> Vec<(String, ClientResult<String>)> {
        let command = Command::keyless(Verb::Version);
        (0..self.servers.len())
            .map(|index| {
                let result = self.run(index, &command).and_then(|reply| match reply {
                    Reply::Value(Response::Version(version)) => Ok(version),
                    Reply::Value(Response::Error(status)) => Err(status.into()),
                    other => Err(ClientError::Protocol(unexpected(&other))),
                });
                (self.label(index).to_string(), result)
            })
            .collect()
    }

    /// Binary `noop` round trip to every server; doubles as a barrier for
    /// earlier quiet commands.
    pub fn noop(&mut self) -> ClientResult<()> {
        if self.config.protocol != Protocol::Binary {
            return Err(ConfigError::BinaryProtocolRequired("noop").into());
        }
        let command = Command::keyless(Verb::Noop);
        for index in 0..self.servers.len() {
            typed(self.run(index, &command)?, |response| match response {
                Response::Ok => Ok(()),
                other => Err(other),
            })?;
        }
        Ok(())
    }

    /// Writes every buffered command and drains the replies they owe.
    ///
    /// Fails with the first error any server reported, including a failed
    /// buffered command whose reply was drained earlier by another call.
    pub fn flush_buffers(&mut self) -> ClientResult<()> {
        let protocol = self.config.protocol;
        let mut first_error = None;
        for entry in self.servers.iter_mut() {
            let connection = &mut entry.connection;
            if let Err(err) = connection.purge(move |buf: &[u8]| codec::decode_response(protocol, buf)) {
                first_error.get_or_insert(err);
            }
            if let Some(status) = connection.take_buffered_failure() {
                first_error.get_or_insert(ClientError::Server(status));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Gracefully closes every connection. Safe to call repeatedly.
    pub fn quit(&mut self) {
        let Ok(frame) = codec::encode(self.config.protocol, &Command::keyless(Verb::Quit), b"") else {
            return;
        };
        for entry in self.servers.iter_mut() {
            entry.connection.quit(&frame);
        }
    }

    /// Closes one server's connection. Returns false when `index` is out of
    /// range or the connection was not open.
    pub fn quit_server(&mut self, index: usize) -> bool {
        let Some(entry) = self.servers.get_mut(index) else {
            return false;
        };
        match codec::encode(self.config.protocol, &Command::keyless(Verb::Quit), b"") {
            Ok(frame) => entry.connection.quit(&frame),
            Err(_) => false,
        }
    }

    /// Servers with an open socket.
    pub fn connected_count(&self) -> usize {
        self.servers.connected_count()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Adds a server; keys are redistributed on the next request.
    pub fn add_server(&mut self, server: ServerConfig) -> Result<usize, ConfigError> {
        self.servers.add(server)
    }

    /// Quits and removes `host:port`. Returns false when it is not configured.
    pub fn remove_server(&mut self, host: &str, port: u16) -> bool {
        let Some(index) = self.servers.position(host, port) else {
            return false;
        };
        self.quit_server(index);
        self.servers.remove(index).is_some()
    }

    pub fn server_state(&self, index: usize) -> Option<&ConnectionState> {
        self.servers.get(index).map(|entry| entry.connection.state())
    }

    pub fn server_snapshot(&self, index: usize) -> Option<ConnectionSnapshot> {
        self.servers.get(index).map(|entry| entry.connection.snapshot())
    }

    /// Index of the server that would serve `group_key` right now.
    pub fn server_for_key(&mut self, group_key: &[u8]) -> ClientResult<usize> {
        self.primary(group_key)
    }

    // ---- internals ------------------------------------------------------

    fn retrieve(&mut self, group_key: &[u8], command: Command<'_>) -> ClientResult<Option<Item>> {
        let key = command.key;
        match self.execute(group_key, command)? {
            Reply::Value(Response::Value(mut item)) => {
                item.key = key.to_vec();
                Ok(Some(item))
            }
            Reply::Value(Response::End) | Reply::Value(Response::Error(ServerStatus::NotFound)) => Ok(None),
            Reply::Value(Response::Error(status)) => Err(status.into()),
            other => Err(ClientError::Protocol(unexpected(&other))),
        }
    }

    fn store(&mut self, group_key: &[u8], command: Command<'_>) -> ClientResult<Reply<()>> {
        let command = command.with_no_reply(self.config.no_reply);
        typed(self.execute(group_key, command)?, |response| match response {
            Response::Stored => Ok(()),
            other => Err(other),
        })
    }

    fn count(&mut self, group_key: &[u8], command: Command<'_>) -> ClientResult<Reply<u64>> {
        let command = command.with_no_reply(self.config.no_reply);
        typed(self.execute(group_key, command)?, |response| match response {
            Response::Numeric(value) => Ok(value),
            other => Err(other),
        })
    }

    fn check_key(&self, key: &[u8]) -> ClientResult<()> {
        validate_key(
            key,
            self.config.namespace.as_bytes(),
            self.config.protocol,
            self.config.verify_key,
        )?;
        Ok(())
    }

    fn check(&self, command: &Command<'_>) -> ClientResult<()> {
        if !command.verb.is_keyed() {
            return Err(ConfigError::Unroutable(command.verb).into());
        }
        self.check_key(command.key)?;
        if self.config.protocol == Protocol::Text && command.initial.is_some() {
            return Err(ConfigError::BinaryProtocolRequired("counter seeding").into());
        }
        Ok(())
    }

    /// Rebuilds the distribution when the server list changed.
    fn refresh(&mut self) {
        let generation = self.servers.generation();
        if self.distributor.generation() == Some(generation) {
            return;
        }
        let nodes = self.servers.ring_nodes();
        if self.distributor.refresh(generation, &nodes) {
            debug!(generation, servers = nodes.len(), "distribution rebuilt");
        }
    }

    fn candidates(&mut self, group_key: &[u8]) -> (u32, Vec<usize>) {
        self.refresh();
        let digest = self.distributor.digest(group_key);
        let now = Instant::now();
        let servers = &self.servers;
        let candidates = self
            .distributor
            .candidates(digest, |index| servers.is_available(index, now));
        (digest, candidates)
    }

    fn primary(&mut self, group_key: &[u8]) -> ClientResult<usize> {
        let (_, candidates) = self.candidates(group_key);
        candidates.first().copied().ok_or(ClientError::NoServersAvailable)
    }

    fn label(&self, index: usize) -> &str {
        self.servers.get(index).map_or("?", |entry| entry.connection.label())
    }

    /// Runs one command on one server.
    fn run(&mut self, index: usize, command: &Command<'_>) -> ClientResult<Reply<Response>> {
        let protocol = self.config.protocol;
        let buffered = self.config.buffer_requests && command.verb.is_keyed() && !command.verb.is_read();
        let frame = codec::encode(protocol, command, self.config.namespace.as_bytes())?;
        let connector = self.connector.as_ref();
        let Some(entry) = self.servers.get_mut(index) else {
            return Err(ClientError::NoServersAvailable);
        };
        let connection = &mut entry.connection;

        if buffered {
            connection.enqueue(connector, &frame, command.expects_reply())?;
            return Ok(Reply::Buffered);
        }
        if !command.expects_reply() {
            connection.send(connector, &frame)?;
            return Ok(Reply::NotRequested);
        }

        connection.purge(move |buf: &[u8]| codec::decode_response(protocol, buf))?;
        connection.send(connector, &frame)?;
        read_reply(connection, protocol, command.verb).map(Reply::Value)
    }

    /// Copies a successful write to the key's replicas as a no-reply command.
    fn mirror(&mut self, digest: u32, primary: usize, command: &Command<'_>) {
        let mut replica = *command;
        if replica.verb == Verb::Cas {
            replica.verb = Verb::Set;
            replica.cas = 0;
        }
        replica.no_reply = codec::supports_no_reply(self.config.protocol, replica.verb);

        let now = Instant::now();
        for index in self.distributor.replicas(digest, self.config.replicas) {
            if index == primary || !self.servers.is_available(index, now) {
                continue;
            }
            if let Err(err) = self.run(index, &replica) {
                debug!(server = %self.label(index), error = %err, "replica write failed");
            }
        }
    }

    /// Sends one batched retrieval and collects its items into `found`.
    fn fetch_batch(
        &mut self,
        index: usize,
        keys: &[&[u8]],
        found: &mut HashMap<Vec<u8>, Item>,
    ) -> ClientResult<()> {
        let protocol = self.config.protocol;
        let namespace = self.config.namespace.as_bytes();
        let frame = codec::encode_multi_get(protocol, Verb::Get, keys, namespace)?;
        let connector = self.connector.as_ref();
        let Some(entry) = self.servers.get_mut(index) else {
            return Err(ClientError::NoServersAvailable);
        };
        let connection = &mut entry.connection;
        let decode = move |buf: &[u8]| codec::decode_response(protocol, buf);

        connection.purge(decode)?;
        connection.send(connector, &frame)?;
        connection.set_cursor_active(true);

        let expected = codec::multi_get_replies(protocol, keys.len());
        let mut replies = 0;
        while expected != Some(replies) {
            let response = connection.read_response(decode)?;
            replies += 1;
            match response {
                Response::Value(mut item) => {
                    if let Some(key) = item.key.strip_prefix(namespace) {
                        item.key = key.to_vec();
                    }
                    found.insert(item.key.clone(), item);
                }
                Response::End if expected.is_none() => break,
                Response::Error(ServerStatus::NotFound) => {}
                // A text error line ends the retrieval; binary frames keep coming.
                Response::Error(status) if expected.is_none() => {
                    connection.set_cursor_active(false);
                    return Err(status.into());
                }
                Response::Error(status) => {
                    debug!(server = %connection.label(), %status, "batched get failed for one key");
                }
                other => return Err(connection.reset_stream(unexpected(&other))),
            }
        }
        connection.set_cursor_active(false);
        Ok(())
    }
}

/// Reads the reply to `verb`, including the `END` closing a text retrieval.
fn read_reply(connection: &mut Connection, protocol: Protocol, verb: Verb) -> ClientResult<Response> {
    let decode = move |buf: &[u8]| codec::decode_response(protocol, buf);
    let response = connection.read_response(decode)?;
    if !fits(verb, &response) {
        return Err(connection.reset_stream(unexpected(&response)));
    }

    if protocol == Protocol::Text && matches!(response, Response::Value(_)) {
        connection.set_cursor_active(true);
        let closing = connection.read_response(decode)?;
        if closing != Response::End {
            return Err(connection.reset_stream(unexpected(&closing)));
        }
        connection.set_cursor_active(false);
    }
    Ok(response)
}

/// Whether `response` is a legal answer to `verb`.
fn fits(verb: Verb, response: &Response) -> bool {
    match response {
        Response::Error(_) => true,
        Response::Value(_) | Response::End => verb.is_read(),
        Response::Stored => verb.is_storage(),
        Response::Deleted => verb == Verb::Delete,
        Response::Touched => verb == Verb::Touch,
        Response::Numeric(_) => matches!(verb, Verb::Increment | Verb::Decrement),
        Response::Version(_) => verb == Verb::Version,
        Response::Ok => matches!(verb, Verb::FlushAll | Verb::Noop | Verb::Quit),
    }
}

/// Converts a raw reply with `extract`, surfacing server errors.
fn typed<T>(
    reply: Reply<Response>,
    extract: impl FnOnce(Response) -> Result<T, Response>,
) -> ClientResult<Reply<T>> {
    match reply {
        Reply::Value(Response::Error(status)) => Err(ClientError::Server(status)),
        Reply::Value(response) => extract(response)
            .map(Reply::Value)
            .map_err(|other| ClientError::Protocol(unexpected(&other))),
        Reply::NotRequested => Ok(Reply::NotRequested),
        Reply::Buffered => Ok(Reply::Buffered),
    }
}

fn unexpected(reply: &dyn std::fmt::Debug) -> CodecError {
    CodecError::malformed(format!("unexpected reply {reply:?}"))
}

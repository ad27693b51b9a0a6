use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use memlink_client::{
    binary, text, Client, ClientConfig, ClientError, Command, ConfigError, Decoded, Distribution, Item,
    Protocol, Reply, Response, ServerConfig, ServerStatus, Verb,
};
use memlink_common::STATUS_SUCCESS;

/// Commands a fake server received: verb, wire key, no-reply flag.
type Log = Arc<Mutex<Vec<(Verb, Vec<u8>, bool)>>>;

#[derive(Default)]
struct Store {
    items: HashMap<Vec<u8>, Item>,
    next_cas: u64,
}

struct FakeServer {
    port: u16,
    log: Log,
}

impl FakeServer {
    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn received(&self, verb: Verb, key: &[u8]) -> bool {
        self.log
            .lock()
            .unwrap()
            .iter()
            .any(|(seen, seen_key, _)| *seen == verb && seen_key == key)
    }
}

/// Starts an in-memory memcached speaking `protocol` on an ephemeral port.
fn spawn_server(protocol: Protocol) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let log: Log = Arc::default();
    let store = Arc::new(Mutex::new(Store::default()));

    let server_log = log.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let log = server_log.clone();
            let store = store.clone();
            thread::spawn(move || serve(stream, protocol, &store, &log));
        }
    });

    FakeServer { port, log }
}

/// Accepts connections and never answers.
fn spawn_silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    port
}

/// A port nothing listens on.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

fn serve(mut stream: TcpStream, protocol: Protocol, store: &Mutex<Store>, log: &Log) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let decoded = match protocol {
            Protocol::Text => text::decode_request(&buf).map(|decoded| match decoded {
                Decoded::Complete { value, consumed } => Some((answer_text(&value, store, log), consumed)),
                Decoded::NeedMoreData => None,
            }),
            Protocol::Binary => binary::decode_request(&buf).map(|decoded| match decoded {
                Decoded::Complete { value, consumed } => Some((answer_binary(&value, store, log), consumed)),
                Decoded::NeedMoreData => None,
            }),
        };

        match decoded {
            Ok(Some(((reply, quit), consumed))) => {
                buf.drain(..consumed);
                if !reply.is_empty() && stream.write_all(&reply).is_err() {
                    return;
                }
                if quit {
                    return;
                }
            }
            Ok(None) => match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(read) => buf.extend_from_slice(&chunk[..read]),
            },
            Err(_) => return,
        }
    }
}

fn record(log: &Log, command: &Command<'_>) {
    log.lock()
        .unwrap()
        .push((command.verb, command.key.to_vec(), command.no_reply));
}

fn apply(store: &Mutex<Store>, command: &Command<'_>) -> Response {
    let mut store = store.lock().unwrap();
    let key = command.key.to_vec();

    match command.verb {
        Verb::Get | Verb::Gets => store
            .items
            .get(&key)
            .cloned()
            .map_or(Response::Error(ServerStatus::NotFound), Response::Value),
        Verb::Set | Verb::Add | Verb::Replace | Verb::Cas => {
            let existing = store.items.get(&key).map(|item| item.cas);
            match (command.verb, existing) {
                (Verb::Add, Some(_)) | (Verb::Replace, None) => {
                    return Response::Error(ServerStatus::NotStored)
                }
                (Verb::Cas, None) => return Response::Error(ServerStatus::NotFound),
                (Verb::Cas, Some(cas)) if cas != command.cas => {
                    return Response::Error(ServerStatus::Exists)
                }
                _ => {}
            }
            store.next_cas += 1;
            let cas = store.next_cas;
            store.items.insert(
                key.clone(),
                Item {
                    key,
                    value: command.value.to_vec(),
                    flags: command.flags,
                    cas,
                },
            );
            Response::Stored
        }
        Verb::Append | Verb::Prepend => match store.items.get_mut(&key) {
            Some(item) => {
                if command.verb == Verb::Append {
                    item.value.extend_from_slice(command.value);
                } else {
                    item.value.splice(0..0, command.value.iter().copied());
                }
                Response::Stored
            }
            None => Response::Error(ServerStatus::NotStored),
        },
        Verb::Delete => match store.items.remove(&key) {
            Some(_) => Response::Deleted,
            None => Response::Error(ServerStatus::NotFound),
        },
        Verb::Increment | Verb::Decrement => {
            if !store.items.contains_key(&key) {
                return match command.initial {
                    Some(initial) => {
                        let item = Item {
                            key: key.clone(),
                            value: initial.to_string().into_bytes(),
                            ..Item::default()
                        };
                        store.items.insert(key, item);
                        Response::Numeric(initial)
                    }
                    None => Response::Error(ServerStatus::NotFound),
                };
            }
            let item = store.items.get_mut(&key).expect("checked above");
            let Some(current) = std::str::from_utf8(&item.value)
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
            else {
                return Response::Error(ServerStatus::NonNumeric);
            };
            let next = if command.verb == Verb::Increment {
                current.wrapping_add(command.delta)
            } else {
                current.saturating_sub(command.delta)
            };
            item.value = next.to_string().into_bytes();
            Response::Numeric(next)
        }
        Verb::Touch => match store.items.contains_key(&key) {
            true => Response::Touched,
            false => Response::Error(ServerStatus::NotFound),
        },
        Verb::FlushAll => {
            store.items.clear();
            Response::Ok
        }
        Verb::Version => Response::Version("1.6.0-fake".to_string()),
        Verb::Noop | Verb::Quit => Response::Ok,
    }
}

fn answer_text(commands: &[Command<'_>], store: &Mutex<Store>, log: &Log) -> (Vec<u8>, bool) {
    for command in commands {
        record(log, command);
    }
    let Some(first) = commands.first() else {
        return (b"ERROR\r\n".to_vec(), false);
    };
    if first.verb == Verb::Quit {
        return (Vec::new(), true);
    }

    let mut out = Vec::new();
    if first.verb.is_read() {
        for command in commands {
            if let Response::Value(item) = apply(store, command) {
                out.extend_from_slice(format!("VALUE {} {} {}", String::from_utf8_lossy(&item.key), item.flags, item.value.len()).as_bytes());
                if command.verb == Verb::Gets {
                    out.extend_from_slice(format!(" {}", item.cas).as_bytes());
                }
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(&item.value);
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"END\r\n");
        return (out, false);
    }

    let line = match apply(store, first) {
        Response::Stored => "STORED".to_string(),
        Response::Deleted => "DELETED".to_string(),
        Response::Touched => "TOUCHED".to_string(),
        Response::Ok => "OK".to_string(),
        Response::Numeric(value) => value.to_string(),
        Response::Version(version) => format!("VERSION {version}"),
        Response::Error(ServerStatus::NotFound) => "NOT_FOUND".to_string(),
        Response::Error(ServerStatus::Exists) => "EXISTS".to_string(),
        Response::Error(ServerStatus::NotStored) => "NOT_STORED".to_string(),
        Response::Error(ServerStatus::NonNumeric) => {
            "CLIENT_ERROR cannot increment or decrement non-numeric value".to_string()
        }
        other => format!("SERVER_ERROR unexpected {other:?}"),
    };
    if !first.no_reply {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    (out, false)
}

fn answer_binary(command: &Command<'_>, store: &Mutex<Store>, log: &Log) -> (Vec<u8>, bool) {
    record(log, command);
    let opcode = binary::opcode_for(command.verb, command.no_reply);
    let response = apply(store, command);

    let out = match response {
        // Quiet commands still report failures.
        Response::Error(status) => {
            binary::encode_response(opcode, status.binary_code(), &[], &[], status.to_string().as_bytes(), 0)
        }
        _ if command.no_reply => Vec::new(),
        Response::Value(item) => binary::encode_response(
            opcode,
            STATUS_SUCCESS,
            &item.flags.to_be_bytes(),
            &item.key,
            &item.value,
            item.cas,
        ),
        Response::Numeric(value) => {
            binary::encode_response(opcode, STATUS_SUCCESS, &[], &[], &value.to_be_bytes(), 0)
        }
        Response::Version(version) => {
            binary::encode_response(opcode, STATUS_SUCCESS, &[], &[], version.as_bytes(), 0)
        }
        _ => binary::encode_response(opcode, STATUS_SUCCESS, &[], &[], &[], 0),
    };
    (out, command.verb == Verb::Quit)
}

fn config_for(addrs: &[String], protocol: Protocol) -> ClientConfig {
    let mut config = ClientConfig::with_servers(addrs).expect("config");
    config.protocol = protocol;
    config.connect_timeout_ms = 1_000;
    config.read_timeout_ms = 1_000;
    config.write_timeout_ms = 1_000;
    config
}

fn client(config: ClientConfig) -> Client {
    Client::new(config).expect("client")
}

/// First key of the form `k<n>` that routes to `server`.
fn key_for(client: &mut Client, server: usize) -> Vec<u8> {
    (0..1_000)
        .map(|n| format!("k{n}").into_bytes())
        .find(|key| client.server_for_key(key).unwrap() == server)
        .expect("some key routes to every server")
}

fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn text_increment_accumulates() {
    let server = spawn_server(Protocol::Text);
    let mut client = client(config_for(&[server.addr()], Protocol::Text));

    client.set(b"counter", b"0", 0, 0).unwrap();
    assert_eq!(client.increment(b"counter", 5).unwrap(), Reply::Value(5));
    assert_eq!(client.increment(b"counter", 3).unwrap(), Reply::Value(8));
    assert_eq!(client.decrement(b"counter", 10).unwrap(), Reply::Value(0));
    assert!(client.increment(b"missing", 1).unwrap_err().is_not_found());

    client.set(b"word", b"abc", 0, 0).unwrap();
    assert!(matches!(
        client.increment(b"word", 1).unwrap_err(),
        ClientError::Server(ServerStatus::NonNumeric)
    ));
}

#[test]
fn text_storage_round_trip() {
    let server = spawn_server(Protocol::Text);
    let mut client = client(config_for(&[server.addr()], Protocol::Text));

    assert_eq!(client.set(b"key", b"value", 42, 0).unwrap(), Reply::Value(()));
    let item = client.get(b"key").unwrap().expect("hit");
    assert_eq!(item.value, b"value");
    assert_eq!(item.flags, 42);

    let cas = client.gets(b"key").unwrap().expect("hit").cas;
    assert_ne!(cas, 0);
    assert!(matches!(
        client.cas(b"key", b"stale", 0, 0, cas + 100).unwrap_err(),
        ClientError::Server(ServerStatus::Exists)
    ));
    client.cas(b"key", b"fresh", 0, 0, cas).unwrap();

    client.append(b"key", b"!").unwrap();
    client.prepend(b"key", b">").unwrap();
    assert_eq!(client.get(b"key").unwrap().unwrap().value, b">fresh!");

    assert!(matches!(
        client.add(b"key", b"x", 0, 0).unwrap_err(),
        ClientError::Server(ServerStatus::NotStored)
    ));
    client.touch(b"key", 60).unwrap();
    client.delete(b"key").unwrap();
    assert_eq!(client.get(b"key").unwrap(), None);
    assert!(client.replace(b"key", b"x", 0, 0).is_err());
}

#[test]
fn binary_storage_and_seeded_counters() {
    let server = spawn_server(Protocol::Binary);
    let mut client = client(config_for(&[server.addr()], Protocol::Binary));

    client.set(b"key", b"value", 7, 0).unwrap();
    let item = client.gets(b"key").unwrap().expect("hit");
    assert_eq!(item.value, b"value");
    assert_eq!(item.flags, 7);
    assert_ne!(item.cas, 0);
    assert_eq!(client.get(b"nope").unwrap(), None);

    assert_eq!(client.increment_with_initial(b"hits", 5, 10, 0).unwrap(), Reply::Value(10));
    assert_eq!(client.increment(b"hits", 5).unwrap(), Reply::Value(15));
    assert_eq!(client.decrement_with_initial(b"hits", 20, 0, 0).unwrap(), Reply::Value(0));

    client.noop().unwrap();
    assert!(client.delete(b"nope").unwrap_err().is_not_found());
}

#[test]
fn binary_quiet_commands_do_not_wait() {
    let server = spawn_server(Protocol::Binary);
    let mut config = config_for(&[server.addr()], Protocol::Binary);
    config.no_reply = true;
    let mut client = client(config);

    let started = Instant::now();
    assert_eq!(client.set(b"n", b"1", 0, 0).unwrap(), Reply::NotRequested);
    assert_eq!(client.increment(b"n", 4).unwrap(), Reply::NotRequested);
    // Fails on the server; the quiet error frame is skipped on the next read.
    assert_eq!(client.increment(b"absent", 1).unwrap(), Reply::NotRequested);
    assert!(started.elapsed() < Duration::from_millis(500));

    client.noop().unwrap();
    assert!(server.received(Verb::Increment, b"n"));
    assert!(server.log.lock().unwrap().iter().all(|(verb, _, quiet)| *verb == Verb::Noop || *quiet));
    assert_eq!(client.get(b"n").unwrap().unwrap().value, b"5");
}

#[test]
fn oversized_key_is_rejected_before_any_io() {
    let server = spawn_server(Protocol::Text);
    let mut client = client(config_for(&[server.addr()], Protocol::Text));

    let key = vec![b'k'; 251];
    let err = client.get(&key).unwrap_err();
    assert!(matches!(err, ClientError::Config(ConfigError::Key(_))));
    assert!(client.set(&key, b"v", 0, 0).is_err());
    assert!(client.get_multi(&[&b"ok"[..], &key[..]]).is_err());
    assert_eq!(client.connected_count(), 0);
    assert!(server.log.lock().unwrap().is_empty());
}

#[test]
fn quit_all_disconnects_every_server() {
    let first = spawn_server(Protocol::Text);
    let second = spawn_server(Protocol::Text);
    let mut client = client(config_for(&[first.addr(), second.addr()], Protocol::Text));

    for server in 0..2 {
        let key = key_for(&mut client, server);
        client.set(&key, b"1", 0, 0).unwrap();
    }
    assert_eq!(client.connected_count(), 2);

    client.quit();
    assert_eq!(client.connected_count(), 0);
    client.quit();
    assert_eq!(client.connected_count(), 0);
    assert!(!client.quit_server(5));

    assert!(wait_for(|| first.received(Verb::Quit, b"") && second.received(Verb::Quit, b"")));

    // The next request reconnects lazily.
    let key = key_for(&mut client, 0);
    assert!(client.get(&key).unwrap().is_some());
    assert_eq!(client.connected_count(), 1);
}

#[test]
fn reads_fail_over_and_writes_do_not() {
    let live = spawn_server(Protocol::Text);
    let dead = format!("127.0.0.1:{}", closed_port());
    let config = config_for(&[dead, live.addr()], Protocol::Text);
    let mut client = client(config.clone());

    let key = key_for(&mut client, 0);
    assert_eq!(client.get(&key).unwrap(), None);
    assert!(live.received(Verb::Get, &key));

    let err = client.set(&key, b"v", 0, 0).unwrap_err();
    assert!(err.is_retryable());

    let mut retrying = config;
    retrying.retry_writes = true;
    let mut client = self::client(retrying);
    client.set(&key, b"v", 0, 0).unwrap();
    assert!(client.increment(&key, 1).is_err());
}

#[test]
fn dead_server_is_skipped_until_retry_timeout() {
    let live = spawn_server(Protocol::Text);
    let dead = format!("127.0.0.1:{}", closed_port());
    let mut config = config_for(&[dead, live.addr()], Protocol::Text);
    config.server_failure_limit = 1;
    config.retry_timeout_ms = 60_000;
    let mut client = client(config);

    let key = key_for(&mut client, 0);
    client.get(&key).unwrap();
    assert!(matches!(
        client.server_state(0),
        Some(memlink_client::ConnectionState::Failed { .. })
    ));

    // Routing now skips the dead server, so writes land on the live one.
    assert_eq!(client.server_for_key(&key).unwrap(), 1);
    client.set(&key, b"v", 0, 0).unwrap();
    assert!(live.received(Verb::Set, &key));
}

#[test]
fn silent_server_times_out() {
    let port = spawn_silent_server();
    let mut config = config_for(&[format!("127.0.0.1:{port}")], Protocol::Text);
    config.read_timeout_ms = 200;
    let mut client = client(config);

    let err = client.get(b"key").unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }), "{err:?}");
    assert_eq!(client.connected_count(), 0);
}

#[test]
fn writes_are_mirrored_to_replicas() {
    let first = spawn_server(Protocol::Text);
    let second = spawn_server(Protocol::Text);
    let mut config = config_for(&[first.addr(), second.addr()], Protocol::Text);
    config.replicas = 1;
    let mut client = client(config);

    client.set(b"shared", b"v", 0, 0).unwrap();
    client.delete(b"shared").unwrap();
    assert!(wait_for(|| {
        [&first, &second].iter().all(|server| {
            server.received(Verb::Set, b"shared") && server.received(Verb::Delete, b"shared")
        })
    }));
    let mirrored = [&first, &second].iter().any(|server| {
        server
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|(verb, _, quiet)| *verb == Verb::Set && *quiet)
    });
    assert!(mirrored);
}

#[test]
fn get_multi_spans_servers() {
    let servers: Vec<FakeServer> = (0..3).map(|_| spawn_server(Protocol::Text)).collect();
    let addrs: Vec<String> = servers.iter().map(FakeServer::addr).collect();
    let mut config = config_for(&addrs, Protocol::Text);
    config.namespace = "app:".to_string();
    config.distribution = Distribution::Consistent;
    let mut client = client(config);

    let keys: Vec<Vec<u8>> = (0..20).map(|n| format!("user:{n}").into_bytes()).collect();
    for key in &keys[..15] {
        client.set(key, key, 0, 0).unwrap();
    }

    let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
    let found = client.get_multi(&refs).unwrap();
    assert_eq!(found.len(), 15);
    assert_eq!(found[&b"user:3"[..]].value, b"user:3");
    assert!(!found.contains_key(&b"user:19"[..]));
    assert!(servers.iter().any(|server| server.received(Verb::Get, b"app:user:3")));
}

#[test]
fn binary_get_multi_reads_one_frame_per_key() {
    let server = spawn_server(Protocol::Binary);
    let mut client = client(config_for(&[server.addr()], Protocol::Binary));

    client.set(b"a", b"1", 0, 0).unwrap();
    client.set(b"c", b"3", 0, 0).unwrap();
    let found = client.get_multi(&[&b"a"[..], &b"b"[..], &b"c"[..]]).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[&b"c"[..]].value, b"3");

    // The stream stays aligned afterwards.
    assert_eq!(client.get(b"a").unwrap().unwrap().value, b"1");
}

#[test]
fn buffered_requests_flush_on_demand() {
    let server = spawn_server(Protocol::Text);
    let mut config = config_for(&[server.addr()], Protocol::Text);
    config.buffer_requests = true;
    let mut client = client(config);

    assert_eq!(client.set(b"a", b"1", 0, 0).unwrap(), Reply::Buffered);
    assert_eq!(client.set(b"b", b"2", 0, 0).unwrap(), Reply::Buffered);
    thread::sleep(Duration::from_millis(50));
    assert!(server.log.lock().unwrap().is_empty());

    client.flush_buffers().unwrap();
    assert!(server.received(Verb::Set, b"b"));
    assert_eq!(client.server_snapshot(0).unwrap().pending_responses, 0);
    assert_eq!(client.get(b"a").unwrap().unwrap().value, b"1");
}

#[test]
fn server_wide_commands_reach_every_server() {
    let first = spawn_server(Protocol::Text);
    let second = spawn_server(Protocol::Binary);
    let mut text_client = client(config_for(&[first.addr()], Protocol::Text));
    let mut binary_client = client(config_for(&[second.addr()], Protocol::Binary));

    for client in [&mut text_client, &mut binary_client] {
        client.set(b"k", b"v", 0, 0).unwrap();
        let versions = client.versions();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].1.as_deref().unwrap(), "1.6.0-fake");
        client.flush_all(0).unwrap();
        assert_eq!(client.get(b"k").unwrap(), None);
    }
}

#[test]
fn membership_changes_keep_serving() {
    let first = spawn_server(Protocol::Text);
    let second = spawn_server(Protocol::Text);
    let mut config = config_for(&[first.addr()], Protocol::Text);
    config.distribution = Distribution::ConsistentWeighted;
    let mut client = client(config);

    client.set(b"k", b"v", 0, 0).unwrap();
    let index = client
        .add_server(ServerConfig::new("127.0.0.1", second.port).with_weight(2))
        .unwrap();
    assert_eq!(index, 1);
    assert_eq!(client.server_count(), 2);

    for n in 0..20 {
        let key = format!("key{n}");
        client.set(key.as_bytes(), b"x", 0, 0).unwrap();
    }
    assert!(second.log.lock().unwrap().iter().any(|(verb, _, _)| *verb == Verb::Set));

    assert!(client.remove_server("127.0.0.1", first.port));
    assert_eq!(client.server_count(), 1);
    client.set(b"k", b"again", 0, 0).unwrap();
    assert!(second.received(Verb::Set, b"k"));
}

#[test]
fn config_from_json() {
    let config = ClientConfig::from_json(
        r#"{"servers":[{"host":"127.0.0.1","port":11311,"weight":3}],"protocol":"binary","replicas":1}"#,
    )
    .unwrap();
    assert_eq!(config.protocol, Protocol::Binary);
    assert_eq!(config.servers[0].weight, 3);
    assert!(Client::new(config).is_ok());

    assert!(matches!(
        ClientConfig::from_json(r#"{"servers":[]}"#),
        Err(ConfigError::NoServers)
    ));
}

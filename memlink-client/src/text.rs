//! # Text Protocol Encoding and Parsing
//!
//! Purpose: Encode commands as space-separated ASCII lines and parse the
//! line-oriented replies, without copying keys or payloads.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Each call parses one reply from the front of
//!    the buffer; nothing is remembered between calls.
//! 2. **Binary-Safe Values**: `VALUE` blocks are length-delimited and treated
//!    as raw bytes; only the header line is ASCII.
//! 3. **Fail Fast**: A line that matches no known reply is a framing error.
//!
//! ## Wire Shapes
//!
//! ```text
//! <verb> <key> <flags> <exptime> <bytes>[ <cas>][ noreply]\r\n<data>\r\n
//! incr|decr <key> <offset>[ noreply]\r\n
//! delete <key>[ noreply]\r\n
//! touch <key> <exptime>[ noreply]\r\n
//! get|gets <key>*\r\n  ->  (VALUE <key> <flags> <bytes>[ <cas>]\r\n<data>\r\n)* END\r\n
//! ```

use memlink_common::{CodecError, Command, Item, Response, ServerStatus, Verb};

use crate::codec::{Decoded, Frame};

const CRLF: &[u8] = b"\r\n";
const NOREPLY: &[u8] = b" noreply";

/// Encodes one command.
pub fn encode<'a>(command: &Command<'a>, namespace: &'a [u8]) -> Result<Frame<'a>, CodecError> {
    let verb = command.verb;
    let name = verb
        .text_name()
        .ok_or_else(|| CodecError::malformed("noop has no text form"))?;

    if verb.is_read() {
        return Ok(encode_multi_get(verb, &[command.key], namespace));
    }

    let mut frame = Frame::new();
    frame.push(name.as_bytes());

    if verb.is_keyed() {
        frame.push(b" ");
        frame.push(namespace);
        frame.push(command.key);
    }

    match verb {
        Verb::Set | Verb::Add | Verb::Replace | Verb::Append | Verb::Prepend => {
            frame.push_fmt(format_args!(
                " {} {} {}",
                command.flags,
                command.expiration,
                command.value.len()
            ));
        }
        Verb::Cas => {
            frame.push_fmt(format_args!(
                " {} {} {} {}",
                command.flags,
                command.expiration,
                command.value.len(),
                command.cas
            ));
        }
        Verb::Increment | Verb::Decrement => {
            if command.initial.is_some() {
                return Err(CodecError::malformed(
                    "counter seed cannot be expressed in the text protocol",
                ));
            }
            frame.push_fmt(format_args!(" {}", command.delta));
        }
        Verb::Touch => frame.push_fmt(format_args!(" {}", command.expiration)),
        Verb::FlushAll if command.expiration > 0 => {
            frame.push_fmt(format_args!(" {}", command.expiration));
        }
        _ => {}
    }

    if command.no_reply && !matches!(verb, Verb::Version | Verb::Quit) {
        frame.push_owned(NOREPLY);
    }
    frame.push_owned(CRLF);

    if verb.is_storage() {
        frame.push(command.value);
        frame.push_owned(CRLF);
    }

    Ok(frame)
}

/// Encodes `get`/`gets` for several keys in one line.
pub fn encode_multi_get<'a>(verb: Verb, keys: &[&'a [u8]], namespace: &'a [u8]) -> Frame<'a> {
    let mut frame = Frame::new();
    frame.push(if verb == Verb::Gets { &b"gets"[..] } else { &b"get"[..] });
    for &key in keys {
        frame.push(b" ");
        frame.push(namespace);
        frame.push(key);
    }
    frame.push_owned(CRLF);
    frame
}

/// Parses one reply from the front of `buf`.
pub fn decode_response(buf: &[u8]) -> Result<Decoded<Response>, CodecError> {
    let Some(line_end) = find_crlf(buf) else {
        return Ok(Decoded::NeedMoreData);
    };
    let line = &buf[..line_end];
    let consumed = line_end + CRLF.len();

    if let Some(rest) = line.strip_prefix(b"VALUE ") {
        return decode_value(buf, rest, consumed);
    }

    let response = match line {
        b"END" => Response::End,
        b"STORED" => Response::Stored,
        b"DELETED" => Response::Deleted,
        b"TOUCHED" => Response::Touched,
        b"OK" => Response::Ok,
        b"NOT_STORED" => Response::Error(ServerStatus::NotStored),
        b"EXISTS" => Response::Error(ServerStatus::Exists),
        b"NOT_FOUND" => Response::Error(ServerStatus::NotFound),
        b"ERROR" => Response::Error(ServerStatus::UnknownCommand),
        _ => {
            if let Some(version) = line.strip_prefix(b"VERSION ") {
                Response::Version(String::from_utf8_lossy(version).into_owned())
            } else if let Some(message) = line.strip_prefix(b"CLIENT_ERROR ") {
                Response::Error(client_error(message))
            } else if let Some(message) = line.strip_prefix(b"SERVER_ERROR ") {
                Response::Error(server_error(message))
            } else if line.first().is_some_and(u8::is_ascii_digit) {
                // Servers may pad counter replies with trailing spaces.
                Response::Numeric(parse_u64(trim_end(line))?)
            } else {
                return Err(CodecError::malformed(format!(
                    "unexpected reply line {:?}",
                    String::from_utf8_lossy(line)
                )));
            }
        }
    };

    Ok(Decoded::Complete {
        value: response,
        consumed,
    })
}

fn decode_value(buf: &[u8], header: &[u8], line_len: usize) -> Result<Decoded<Response>, CodecError> {
    let mut tokens = tokens(header);
    let key = tokens.next().ok_or_else(|| CodecError::malformed("VALUE without key"))?;
    let flags = parse_u32(tokens.next().ok_or_else(|| CodecError::malformed("VALUE without flags"))?)?;
    let len = parse_usize(tokens.next().ok_or_else(|| CodecError::malformed("VALUE without length"))?)?;
    let cas = match tokens.next() {
        Some(token) => parse_u64(token)?,
        None => 0,
    };

    let data_end = line_len
        .checked_add(len)
        .ok_or_else(|| CodecError::malformed("VALUE length overflows"))?;
    let total = data_end + CRLF.len();
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }
    if &buf[data_end..total] != CRLF {
        return Err(CodecError::malformed("VALUE data not terminated by CRLF"));
    }

    Ok(Decoded::Complete {
        value: Response::Value(Item {
            key: key.to_vec(),
            value: buf[line_len..data_end].to_vec(),
            flags,
            cas,
        }),
        consumed: total,
    })
}

fn client_error(message: &[u8]) -> ServerStatus {
    let text = String::from_utf8_lossy(message).into_owned();
    if text.contains("non-numeric") {
        ServerStatus::NonNumeric
    } else {
        ServerStatus::ClientError(text)
    }
}

fn server_error(message: &[u8]) -> ServerStatus {
    let text = String::from_utf8_lossy(message).into_owned();
    if text.starts_with("out of memory") {
        ServerStatus::OutOfMemory
    } else if text.starts_with("object too large") {
        ServerStatus::ValueTooLarge
    } else {
        ServerStatus::ServerError(text)
    }
}

/// Parses one request from the front of `buf`.
///
/// Retrievals yield one command per key; every other verb yields exactly
/// one. Keys are returned as sent, namespace included.
pub fn decode_request(buf: &[u8]) -> Result<Decoded<Vec<Command<'_>>>, CodecError> {
    let Some(line_end) = find_crlf(buf) else {
        return Ok(Decoded::NeedMoreData);
    };
    let line = &buf[..line_end];
    let mut consumed = line_end + CRLF.len();

    let mut tokens = tokens(line);
    let name = tokens.next().ok_or_else(|| CodecError::malformed("empty command line"))?;
    let verb = Verb::from_text_name(name).ok_or_else(|| {
        CodecError::malformed(format!("unknown command {:?}", String::from_utf8_lossy(name)))
    })?;

    if verb.is_read() {
        let commands: Vec<Command<'_>> = tokens.map(|key| Command::new(verb, key)).collect();
        if commands.is_empty() {
            return Err(CodecError::malformed("retrieval without keys"));
        }
        return Ok(Decoded::Complete {
            value: commands,
            consumed,
        });
    }

    let args: Vec<&[u8]> = tokens.collect();
    let (args, no_reply) = match args.split_last() {
        Some((last, rest)) if *last == b"noreply" => (rest, true),
        _ => (&args[..], false),
    };
    let arg = |index: usize| {
        args.get(index)
            .copied()
            .ok_or_else(|| CodecError::malformed(format!("missing argument {index}")))
    };

    let mut command = match verb {
        Verb::Set | Verb::Add | Verb::Replace | Verb::Append | Verb::Prepend | Verb::Cas => {
            let len = parse_usize(arg(3)?)?;
            let data_end = consumed + len;
            let total = data_end + CRLF.len();
            if buf.len() < total {
                return Ok(Decoded::NeedMoreData);
            }
            if &buf[data_end..total] != CRLF {
                return Err(CodecError::malformed("data block not terminated by CRLF"));
            }
            let mut command = Command::store(
                verb,
                arg(0)?,
                &buf[consumed..data_end],
                parse_u32(arg(1)?)?,
                parse_u32(arg(2)?)?,
            );
            if verb == Verb::Cas {
                command.cas = parse_u64(arg(4)?)?;
            }
            consumed = total;
            command
        }
        Verb::Delete => Command::new(verb, arg(0)?),
        Verb::Increment | Verb::Decrement => Command::counter(verb, arg(0)?, parse_u64(arg(1)?)?),
        Verb::Touch => Command::new(verb, arg(0)?).with_expiration(parse_u32(arg(1)?)?),
        Verb::FlushAll => {
            let delay = match args.first() {
                Some(token) => parse_u32(token)?,
                None => 0,
            };
            Command::keyless(verb).with_expiration(delay)
        }
        _ => Command::keyless(verb),
    };
    command.no_reply = no_reply;

    Ok(Decoded::Complete {
        value: vec![command],
        consumed,
    })
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == CRLF)
}

fn tokens(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|&byte| byte == b' ').filter(|token| !token.is_empty())
}

fn trim_end(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != b' ').map_or(0, |pos| pos + 1);
    &data[..end]
}

fn parse_u64(data: &[u8]) -> Result<u64, CodecError> {
    if data.is_empty() {
        return Err(CodecError::malformed("empty number"));
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(CodecError::malformed("non-digit in number"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or_else(|| CodecError::malformed("number overflows 64 bits"))?;
    }
    Ok(value)
}

fn parse_u32(data: &[u8]) -> Result<u32, CodecError> {
    u32::try_from(parse_u64(data)?).map_err(|_| CodecError::malformed("number overflows 32 bits"))
}

fn parse_usize(data: &[u8]) -> Result<usize, CodecError> {
    usize::try_from(parse_u64(data)?).map_err(|_| CodecError::malformed("length overflows usize"))
}

//! # Binary Protocol Encoding and Parsing
//!
//! Purpose: Encode commands as length-prefixed frames and parse response
//! frames once their declared body is fully buffered.
//!
//! ## Design Principles
//! 1. **Header in Scratch, Body Borrowed**: The 24-byte header and extras are
//!    formatted into the frame's scratch buffer; namespace, key and value are
//!    borrowed segments.
//! 2. **Quiet Instead of Flags**: `noreply` selects the opcode's quiet variant.
//!    Quiet frames are never read back.
//! 3. **Length Before Trust**: A response is complete only when
//!    `24 + body_len` bytes are present.

use memlink_common::{
    read_u32, read_u64, CodecError, Command, CounterExtras, Header, Item, Opcode, Response,
    ServerStatus, StoreExtras, Verb, EXPIRATION_EXTRAS_LEN, EXPIRATION_NOT_ADD, GET_EXTRAS_LEN,
    HEADER_LEN, MAX_BINARY_KEY_LENGTH, REQUEST_MAGIC, RESPONSE_MAGIC,
};

use crate::codec::{Decoded, Frame};

/// Opcode a verb is sent with. Retrievals always use the loud `GETK`.
pub fn opcode_for(verb: Verb, quiet: bool) -> Opcode {
    let opcode = match verb {
        Verb::Get | Verb::Gets => return Opcode::GetK,
        Verb::Set | Verb::Cas => Opcode::Set,
        Verb::Add => Opcode::Add,
        Verb::Replace => Opcode::Replace,
        Verb::Append => Opcode::Append,
        Verb::Prepend => Opcode::Prepend,
        Verb::Delete => Opcode::Delete,
        Verb::Increment => Opcode::Increment,
        Verb::Decrement => Opcode::Decrement,
        Verb::Touch => Opcode::Touch,
        Verb::FlushAll => Opcode::Flush,
        Verb::Version => Opcode::Version,
        Verb::Noop => Opcode::Noop,
        Verb::Quit => Opcode::Quit,
    };
    if quiet {
        opcode.quiet()
    } else {
        opcode
    }
}

/// Encodes one command as a request frame.
pub fn encode<'a>(command: &Command<'a>, namespace: &'a [u8]) -> Result<Frame<'a>, CodecError> {
    let verb = command.verb;
    let opcode = opcode_for(verb, !command.expects_reply());

    let (namespace, key) = if verb.is_keyed() {
        (namespace, command.key)
    } else {
        (&[][..], &[][..])
    };
    let key_len = namespace.len() + key.len();
    if key_len > MAX_BINARY_KEY_LENGTH {
        return Err(CodecError::CommandTooLarge(key_len));
    }

    let mut extras = [0u8; 20];
    let extras_len = match verb {
        Verb::Set | Verb::Add | Verb::Replace | Verb::Cas => {
            let store = StoreExtras {
                flags: command.flags,
                expiration: command.expiration,
            };
            extras[..8].copy_from_slice(&store.encode());
            8
        }
        Verb::Increment | Verb::Decrement => {
            let counter = match command.initial {
                Some(initial) => CounterExtras {
                    delta: command.delta,
                    initial,
                    expiration: command.expiration,
                },
                None => CounterExtras {
                    delta: command.delta,
                    initial: 0,
                    expiration: EXPIRATION_NOT_ADD,
                },
            };
            extras.copy_from_slice(&counter.encode());
            20
        }
        Verb::Touch => {
            extras[..4].copy_from_slice(&command.expiration.to_be_bytes());
            4
        }
        Verb::FlushAll if command.expiration > 0 => {
            extras[..4].copy_from_slice(&command.expiration.to_be_bytes());
            4
        }
        _ => 0,
    };

    let value: &'a [u8] = if verb.is_storage() { command.value } else { &[] };
    let body_len = extras_len + key_len + value.len();
    let body_len = u32::try_from(body_len).map_err(|_| CodecError::CommandTooLarge(body_len))?;

    let mut header = Header::request(opcode, key_len as u16, extras_len as u8, body_len);
    if verb == Verb::Cas {
        header.cas = command.cas;
    }

    let mut frame = Frame::new();
    frame.push_owned(&header.encode());
    frame.push_owned(&extras[..extras_len]);
    frame.push(namespace);
    frame.push(key);
    frame.push(value);
    Ok(frame)
}

/// One loud `GETK` per key; the server answers each in order.
pub fn encode_multi_get<'a>(keys: &[&'a [u8]], namespace: &'a [u8]) -> Result<Frame<'a>, CodecError> {
    let mut frame = Frame::new();
    for &key in keys {
        frame.append(encode(&Command::new(Verb::Get, key), namespace)?);
    }
    Ok(frame)
}

/// Splits a complete frame at the front of `buf` into header and body parts.
fn split_frame(buf: &[u8], magic: u8) -> Result<Option<(Header, &[u8], &[u8], &[u8])>, CodecError> {
    if let Some(&first) = buf.first() {
        if first != magic {
            return Err(CodecError::BadMagic(first));
        }
    }
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = Header::decode(buf)?;
    if buf.len() < header.frame_len() {
        return Ok(None);
    }
    let value_len = header.value_len()?;
    let body = &buf[HEADER_LEN..header.frame_len()];
    let (extras, rest) = body.split_at(header.extras_len as usize);
    let (key, value) = rest.split_at(rest.len() - value_len);
    Ok(Some((header, extras, key, value)))
}

/// Parses one response frame from the front of `buf`.
///
/// A quiet command only answers when it fails, and nobody waits for that
/// answer; such frames are consumed and skipped.
pub fn decode_response(buf: &[u8]) -> Result<Decoded<Response>, CodecError> {
    let mut skipped = 0;
    loop {
        let Some((header, extras, key, value)) = split_frame(&buf[skipped..], RESPONSE_MAGIC)? else {
            return Ok(Decoded::NeedMoreData);
        };
        let opcode =
            Opcode::from_u8(header.opcode).ok_or(CodecError::UnexpectedOpcode(header.opcode))?;
        if opcode.is_quiet() {
            skipped += header.frame_len();
            continue;
        }
        return decode_frame(header, opcode, extras, key, value).map(|response| Decoded::Complete {
            value: response,
            consumed: skipped + header.frame_len(),
        });
    }
}

fn decode_frame(
    header: Header,
    opcode: Opcode,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Result<Response, CodecError> {
    let response = match ServerStatus::from_binary(header.status) {
        Some(status) => Response::Error(status),
        None => match opcode.loud() {
            Opcode::Get | Opcode::GetK => Response::Value(Item {
                key: key.to_vec(),
                value: value.to_vec(),
                flags: if extras.len() == GET_EXTRAS_LEN as usize { read_u32(extras) } else { 0 },
                cas: header.cas,
            }),
            Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Append | Opcode::Prepend => {
                Response::Stored
            }
            Opcode::Delete => Response::Deleted,
            Opcode::Increment | Opcode::Decrement => {
                if value.len() != 8 {
                    return Err(CodecError::malformed("counter reply must carry 8 bytes"));
                }
                Response::Numeric(read_u64(value))
            }
            Opcode::Touch => Response::Touched,
            Opcode::Version => Response::Version(String::from_utf8_lossy(value).into_owned()),
            Opcode::Flush | Opcode::Noop | Opcode::Quit => Response::Ok,
            other => return Err(CodecError::UnexpectedOpcode(other.as_u8())),
        },
    };
    Ok(response)
}

/// Parses one request frame. Keys are returned as sent, namespace included.
pub fn decode_request(buf: &[u8]) -> Result<Decoded<Command<'_>>, CodecError> {
    let Some((header, extras, key, value)) = split_frame(buf, REQUEST_MAGIC)? else {
        return Ok(Decoded::NeedMoreData);
    };
    let opcode = Opcode::from_u8(header.opcode).ok_or(CodecError::UnexpectedOpcode(header.opcode))?;

    let verb = match opcode.loud() {
        Opcode::Get | Opcode::GetK => Verb::Get,
        Opcode::Set if header.cas != 0 => Verb::Cas,
        Opcode::Set => Verb::Set,
        Opcode::Add => Verb::Add,
        Opcode::Replace => Verb::Replace,
        Opcode::Append => Verb::Append,
        Opcode::Prepend => Verb::Prepend,
        Opcode::Delete => Verb::Delete,
        Opcode::Increment => Verb::Increment,
        Opcode::Decrement => Verb::Decrement,
        Opcode::Touch => Verb::Touch,
        Opcode::Flush => Verb::FlushAll,
        Opcode::Version => Verb::Version,
        Opcode::Noop => Verb::Noop,
        Opcode::Quit => Verb::Quit,
        other => return Err(CodecError::UnexpectedOpcode(other.as_u8())),
    };

    let mut command = Command::new(verb, key);
    command.no_reply = opcode.is_quiet();
    match verb {
        Verb::Set | Verb::Add | Verb::Replace | Verb::Cas => {
            let store = StoreExtras::decode(extras)?;
            command.flags = store.flags;
            command.expiration = store.expiration;
            command.value = value;
            command.cas = header.cas;
        }
        Verb::Append | Verb::Prepend => command.value = value,
        Verb::Increment | Verb::Decrement => {
            let counter = CounterExtras::decode(extras)?;
            command.delta = counter.delta;
            if counter.expiration != EXPIRATION_NOT_ADD {
                command.initial = Some(counter.initial);
                command.expiration = counter.expiration;
            }
        }
        Verb::Touch | Verb::FlushAll => {
            if extras.len() == EXPIRATION_EXTRAS_LEN as usize {
                command.expiration = read_u32(extras);
            } else if verb == Verb::Touch {
                return Err(CodecError::malformed("touch requires 4 bytes of extras"));
            }
        }
        _ => {}
    }

    Ok(Decoded::Complete {
        value: command,
        consumed: header.frame_len(),
    })
}

/// Builds a response frame. Test servers use this to answer requests.
pub fn encode_response(
    opcode: Opcode,
    status: u16,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    cas: u64,
) -> Vec<u8> {
    let body_len = extras.len() + key.len() + value.len();
    let mut header = Header::response(opcode, status, key.len() as u16, extras.len() as u8, body_len as u32);
    header.cas = cas;

    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

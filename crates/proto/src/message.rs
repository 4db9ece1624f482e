// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The minimal DNS wire-format inspection this crate does: the transaction
//! id, the question count, and — if there is exactly one question — its
//! QNAME and QTYPE. Nothing else is decoded or re-encoded; the forwarder
//! treats the rest of the buffer as opaque.

use crate::domain::{Label, Name};
use crate::error::Error;

const HEADER_LEN: usize = 12;

/// A borrowed view over enough of a message to route and remap it.
#[derive(Debug)]
pub struct MessageView<'a> {
    buf: &'a [u8],
    qdcount: u16,
    question: Option<(Name, u16)>,
}

impl<'a> MessageView<'a> {
    /// Parses just the header and, if `qdcount == 1`, the first question's
    /// QNAME and QTYPE. Fails with `Error::Parse` if the buffer is too short
    /// for a header or the question section is malformed.
    pub fn parse(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::parse("message shorter than a DNS header"));
        }
        let qdcount = u16::from_be_bytes([buf[4], buf[5]]);

        let question = if qdcount == 1 {
            Some(parse_first_question(buf)?)
        } else {
            None
        };

        Ok(Self {
            buf,
            qdcount,
            question,
        })
    }

    /// The transaction id, bytes `[0..2)`.
    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn qdcount(&self) -> u16 {
        self.qdcount
    }

    /// The first question's QNAME, present only when `qdcount == 1`. A
    /// query with zero or multiple questions is treated as unroutable.
    pub fn question(&self) -> Option<&Name> {
        self.question.as_ref().map(|(name, _)| name)
    }

    /// The first question's QTYPE. Used only by the answer-cache lookup
    /// key `(qname, qtype)`; routing otherwise never inspects it.
    pub fn question_type(&self) -> Option<u16> {
        self.question.as_ref().map(|(_, qtype)| *qtype)
    }
}

/// Overwrites bytes `[0..2)` of `buf` with `id`, in network byte order.
pub fn set_id(buf: &mut [u8], id: u16) -> Result<(), Error> {
    if buf.len() < 2 {
        return Err(Error::parse("message shorter than a transaction id"));
    }
    buf[0..2].copy_from_slice(&id.to_be_bytes());
    Ok(())
}

/// Reads the transaction id without fully parsing the message; used by the
/// upstream client's dispatcher, which only needs to demux on id.
pub fn peek_id(buf: &[u8]) -> Result<u16, Error> {
    if buf.len() < 2 {
        return Err(Error::parse("message shorter than a transaction id"));
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

fn parse_first_question(buf: &[u8]) -> Result<(Name, u16), Error> {
    let mut pos = HEADER_LEN;
    let mut labels = Vec::new();

    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| Error::parse("question name runs past end of buffer"))?;
        pos += 1;

        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            // Compression pointers never appear in the question section
            // of a well-formed query.
            return Err(Error::parse("unexpected compression pointer in question"));
        }

        let len = len as usize;
        let label = buf
            .get(pos..pos + len)
            .ok_or_else(|| Error::parse("label runs past end of buffer"))?;
        labels.push(Label::new(label.to_vec()));
        pos += len;
    }

    // qtype + qclass must still be present, even though nothing here reads
    // qclass, to confirm this is a well-formed question section.
    let qtype_bytes = buf
        .get(pos..pos + 4)
        .ok_or_else(|| Error::parse("question section missing qtype/qclass"))?;
    let qtype = u16::from_be_bytes([qtype_bytes[0], qtype_bytes[1]]);

    Ok((Name::from_labels(labels), qtype))
}

/*! A low-latency reliable-ARQ transport for unreliable datagram networks.

`larq` implements a reliable, ordered, message-oriented transport protocol
on top of any unreliable, unordered datagram substrate (typically UDP, but
nothing here depends on it). Compared with stream-oriented reliable
transports it trades a modest amount of extra bandwidth for a much lower
end-to-end latency: retransmission timeouts are shorter and re-armed more
aggressively, duplicate acknowledgements trigger fast retransmission, and
congestion, window and delay behavior are tunable by the host.

# Sans-IO design

The crate contains no sockets, no threads and no clocks. All protocol state
for one conversation lives in a [`Session`](session/struct.Session.html),
which is driven entirely by its host:

  * inbound datagrams are handed to [`Session::input`](session/struct.Session.html#method.input);
  * outbound datagrams are emitted through a host-provided
    [`Sink`](session/trait.Sink.html) passed into
    [`Session::update`](session/struct.Session.html#method.update);
  * time is injected as a monotonic millisecond
    [`Instant`](time/struct.Instant.html), and
    [`Session::check`](session/struct.Session.html#method.check) tells the
    host when the next call to `update` is due.

This makes the state machine trivial to embed in blocking, event-driven or
`async` hosts alike, and deterministic to test: every scenario in the test
suite runs two sessions against an in-memory channel with a simulated clock.

The module structure mirrors the protocol layering:

  * The [wire](wire/index.html) module implements the segment wire format:
    a fixed 24-byte little-endian header followed by the payload, with
    zero-copy field access and a high-level [`Repr`](wire/struct.Repr.html).
  * The [session](session/index.html) module implements the control block:
    fragmentation and reassembly, the send/receive windows, acknowledgement
    and probe scheduling, RTT estimation, congestion control, and the
    periodic flush.
  * The [time](time/index.html) module provides the `Instant` and
    `Duration` value types used for all timer arithmetic.

# Feature flags

  * `std` (default): conveniences for hosted environments; the crate core
    is `no_std` and only requires `alloc`.
  * `log` (default): protocol tracing through the `log` crate.
  * `defmt`: protocol tracing and value formatting through `defmt`, for
    bare-metal targets.
  * `fastack-conserve`: conservative duplicate-ACK counting, robust against
    reordered acknowledgements at the cost of some fast-resend eagerness.
*/

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
#[macro_use]
extern crate std;

#[macro_use]
mod macros;

pub mod session;
pub mod time;
pub mod wire;

pub use self::session::{
    DelayMode, InputError, InvalidMtuError, RecvError, SendError, Session, Sink, State,
};

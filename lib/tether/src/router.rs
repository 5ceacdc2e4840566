use crate::codec::{Frame, FrameKind};
use byteorder::{BigEndian, ByteOrder};
use ferrite::spec::{CommandFamily, CommandId, StatusCode};
use hashbrown::HashMap;

/// What a service handler asks the link to do after executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Side effect done (or nothing to do); no frame to send.
    Done,
    /// Response frames to transmit, in order.
    Reply(Vec<(CommandId, Vec<u8>)>),
    /// Report a status back to the peer.
    Fail(StatusCode, Vec<u8>),
}

impl Outcome {
    #[inline]
    pub fn reply(command: CommandId, payload: Vec<u8>) -> Outcome {
        Outcome::Reply(vec![(command, payload)])
    }

    #[inline]
    pub fn error() -> Outcome {
        Outcome::Fail(StatusCode::Error, Vec::new())
    }
}

/// A service handler for one command family. The context type carries
/// whatever the owning side needs handlers to reach (runtime state, pending
/// tables, publish queues); the router itself stays side-agnostic.
pub trait Handler<C> {
    fn handle(&mut self, command: CommandId, frame: &Frame, ctx: &mut C) -> Outcome;
}

impl<C, F> Handler<C> for F
where
    F: FnMut(CommandId, &Frame, &mut C) -> Outcome,
{
    fn handle(&mut self, command: CommandId, frame: &Frame, ctx: &mut C) -> Outcome {
        self(command, frame, ctx)
    }
}

/// Table-lookup dispatch from command family to handler. Populated once at
/// init; the link layer depends on this registry, never on concrete
/// services.
pub struct Router<C> {
    handlers: HashMap<CommandFamily, Box<dyn Handler<C>>>,
}

impl<C> Router<C> {
    #[inline]
    pub fn new() -> Router<C> {
        Router {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a command family. Registering a family twice
    /// replaces the earlier handler.
    pub fn register<H: Handler<C> + 'static>(&mut self, family: CommandFamily, handler: H) {
        self.handlers.insert(family, Box::new(handler));
    }

    /// Route one deduplicated command frame. Unknown ids and unregistered
    /// families resolve to the matching status outcome.
    pub fn dispatch(&mut self, frame: &Frame, ctx: &mut C) -> Outcome {
        match frame.kind() {
            FrameKind::Command(command) => match self.handlers.get_mut(&command.family()) {
                Some(handler) => handler.handle(command, frame, ctx),
                None => Outcome::Fail(StatusCode::NotImplemented, id_payload(frame.id)),
            },
            FrameKind::Unknown(id) => Outcome::Fail(StatusCode::CmdUnknown, id_payload(id)),
            FrameKind::Status(_) => Outcome::Done,
        }
    }
}

#[inline]
fn id_payload(id: u16) -> Vec<u8> {
    let mut payload = vec![0u8; 2];
    BigEndian::write_u16(&mut payload, id);
    payload
}

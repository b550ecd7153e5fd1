//! Operator event dispatch.

mod dispatcher;
pub mod legacy;
mod tickets;

pub use dispatcher::{Dispatcher, Handler, HandlerContext, OperatorEvent, UNPAIRED_WHITELIST};
pub use tickets::{DeleteTicket, DeleteTickets};

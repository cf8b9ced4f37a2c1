use crate::error::Error;
use crate::session::SessionWriter;
use futures::Stream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

pub type ID = Uuid;

// Used for generating a new UUID, every time a new client connects the server
pub fn generate_new_uuid() -> Uuid {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let buf = rng.random::<[u8; 16]>();

    Uuid::new_v8(buf)
}

// Every event the transport surfaces to the broker side: a freshly upgraded
// session with its writer handle, each decoded message payload in wire
// order, the eventual disconnect, and errors along the way.
pub enum Event {
    NewClient(ID, SessionWriter),
    NewMessage(ID, Vec<u8>),
    Disconnect(ID),
    Error(ID, Error),
}

// This struct will be used for implementing Stream trait. Thus, the end-user
// doesn't need to interact with the mpsc tokio channel directly
pub struct EventStream {
    receiver: Receiver<Event>,
}

impl EventStream {
    pub fn new(receiver: Receiver<Event>) -> Self {
        Self { receiver }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll_recv(cx)
    }
}

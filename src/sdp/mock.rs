//! Scripted directory client for tests.

use std::{thread, time::Duration};

use parking_lot::Mutex;

use crate::{
   bluetooth::address::PeerAddress,
   sdp::{DirectoryClient, LookupCallback},
};

#[derive(Debug, Clone, Copy)]
pub enum Answer {
   /// Reject the query outright.
   Refuse,
   /// Accept the query and never answer.
   Never,
   /// Answer synchronously, before the resolver starts waiting.
   Immediate(i32),
   /// Answer from another thread after a delay.
   After(Duration, i32),
   /// Answer immediately, but for a different peer.
   ForPeer(PeerAddress, i32),
}

pub struct MockDirectory {
   answer: Answer,
   lookups: Mutex<Vec<(PeerAddress, u16)>>,
}

impl MockDirectory {
   pub fn new(answer: Answer) -> Self {
      Self {
         answer,
         lookups: Mutex::new(Vec::new()),
      }
   }

   pub fn lookups(&self) -> Vec<(PeerAddress, u16)> {
      self.lookups.lock().clone()
   }
}

impl DirectoryClient for MockDirectory {
   fn start_lookup(&self, peer: PeerAddress, service16: u16, callback: LookupCallback) -> bool {
      self.lookups.lock().push((peer, service16));
      match self.answer {
         Answer::Refuse => return false,
         Answer::Never => {},
         Answer::Immediate(channel) => callback.on_result(peer, channel),
         Answer::After(delay, channel) => {
            thread::spawn(move || {
               thread::sleep(delay);
               callback.on_result(peer, channel);
            });
         },
         Answer::ForPeer(other, channel) => callback.on_result(other, channel),
      }
      true
   }
}

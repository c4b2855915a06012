//! Channel allocation strategies for listening sockets.

use serde::{Deserialize, Serialize};

use crate::bluetooth::address::{Channel, ServiceId};

/// First channel tried by [`ChannelPolicy::Sequential`].
const SEQUENTIAL_FIRST: u8 = 12;

/// How a listener picks the channel it binds.
///
/// Without a local service record database, peers cannot discover where a
/// listener is bound, so the default derives the channel from the service
/// identifier exactly like the resolver's fallback does on the client side.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelPolicy {
   /// Bind `service16 & CHANNEL_MASK`; abandon if it is taken.
   #[default]
   Derived,
   /// Try channels 12 through 30 and bind the first free one.
   Sequential,
   /// Always bind the given channel; abandon if it is taken.
   Fixed(Channel),
}

impl ChannelPolicy {
   /// Channels to try, in order.
   pub fn candidates(self, service: ServiceId) -> impl Iterator<Item = Channel> {
      let (first, last) = match self {
         Self::Derived => {
            let channel = service.fallback_channel().get();
            (channel, channel)
         },
         Self::Sequential => (SEQUENTIAL_FIRST, Channel::MAX.get()),
         Self::Fixed(channel) => (channel.get(), channel.get()),
      };
      (first..=last).filter_map(|c| Channel::new(i32::from(c)))
   }
}

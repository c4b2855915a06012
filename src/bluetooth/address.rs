//! Address, service identifier and channel value types.
//!
//! Every value here is validated when it is constructed, so the socket layer
//! never has to re-check an address or a channel number at use time.

use std::{fmt, str::FromStr};

use bluer::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{Result, RfcommError};

/// Length of the canonical `00:11:22:AA:BB:CC` form.
const ADDRESS_LENGTH: usize = 17;
/// Bounds a 16-bit service identifier to the legal channel range.
pub const CHANNEL_MASK: u16 = 0x1E;
/// Bluetooth base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// A validated Bluetooth hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(Address);

impl PeerAddress {
   /// Returns true if `address` is six uppercase hex octet pairs separated by
   /// colons.
   pub fn check(address: &str) -> bool {
      address.len() == ADDRESS_LENGTH
         && address.bytes().enumerate().all(|(i, c)| match i % 3 {
            2 => c == b':',
            _ => matches!(c, b'0'..=b'9' | b'A'..=b'F'),
         })
   }

   pub fn parse(address: &str) -> Result<Self> {
      if !Self::check(address) {
         return Err(RfcommError::InvalidAddress(address.to_string()));
      }
      let mut octets = [0u8; 6];
      for (octet, pair) in octets.iter_mut().zip(address.split(':')) {
         *octet = u8::from_str_radix(pair, 16)
            .map_err(|_| RfcommError::InvalidAddress(address.to_string()))?;
      }
      Ok(Self(Address::new(octets)))
   }

   pub const fn octets(&self) -> [u8; 6] {
      self.0.0
   }
}

impl From<Address> for PeerAddress {
   fn from(address: Address) -> Self {
      Self(address)
   }
}

impl From<PeerAddress> for Address {
   fn from(address: PeerAddress) -> Self {
      address.0
   }
}

impl FromStr for PeerAddress {
   type Err = RfcommError;

   fn from_str(s: &str) -> Result<Self> {
      Self::parse(s)
   }
}

impl fmt::Display for PeerAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.octets();
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

/// A 128-bit service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
   /// Serial Port Profile, `00001101-0000-1000-8000-00805F9B34FB`.
   pub const SERIAL_PORT: Self = Self::from_short(0x1101);

   pub const fn new(uuid: Uuid) -> Self {
      Self(uuid)
   }

   /// Expands a 16-bit identifier onto the Bluetooth base UUID.
   pub const fn from_short(short: u16) -> Self {
      Self(Uuid::from_u128(BASE_UUID | ((short as u128) << 96)))
   }

   /// The reduced 16-bit form used by legacy lookups.
   pub const fn short(&self) -> u16 {
      ((self.0.as_u128() >> 96) & 0xFFFF) as u16
   }

   /// Deterministic channel used when no directory answer is available.
   pub fn fallback_channel(&self) -> Channel {
      // The mask can produce 0, which is not a legal channel.
      Channel::new(i32::from(self.short() & CHANNEL_MASK)).unwrap_or(Channel::MAX)
   }

   pub const fn uuid(&self) -> Uuid {
      self.0
   }
}

impl FromStr for ServiceId {
   type Err = RfcommError;

   fn from_str(s: &str) -> Result<Self> {
      Uuid::parse_str(s)
         .map(Self)
         .map_err(|e| RfcommError::InvalidServiceId(format!("{s}: {e}")))
   }
}

impl fmt::Display for ServiceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(&self.0.hyphenated(), f)
   }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("RFCOMM channel {0} outside 1..=30")]
pub struct InvalidChannel(pub i32);

/// An RFCOMM channel number in `1..=30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Channel(u8);

impl Channel {
   pub const MIN: Self = Self(1);
   pub const MAX: Self = Self(30);

   pub const fn new(value: i32) -> Option<Self> {
      if value >= Self::MIN.0 as i32 && value <= Self::MAX.0 as i32 {
         Some(Self(value as u8))
      } else {
         None
      }
   }

   pub const fn get(self) -> u8 {
      self.0
   }
}

impl TryFrom<u8> for Channel {
   type Error = InvalidChannel;

   fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
      Self::new(i32::from(value)).ok_or(InvalidChannel(i32::from(value)))
   }
}

impl From<Channel> for u8 {
   fn from(channel: Channel) -> Self {
      channel.0
   }
}

impl fmt::Display for Channel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(&self.0, f)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_valid_address() {
      assert!(PeerAddress::check("00:11:22:AA:BB:CC"));
      assert!(PeerAddress::check("FF:FF:FF:FF:FF:FF"));

      let addr = PeerAddress::parse("00:11:22:AA:BB:CC").unwrap();
      assert_eq!(addr.octets(), [0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]);
      assert_eq!(addr.to_string(), "00:11:22:AA:BB:CC");
   }

   #[test]
   fn test_invalid_address() {
      // Lowercase
      assert!(!PeerAddress::check("00:11:22:aa:bb:cc"));
      // Length 16
      assert!(!PeerAddress::check("00:11:22:AA:BB:C"));
      // Length 18
      assert!(!PeerAddress::check("00:11:22:AA:BB:CCD"));
      // Misplaced separators
      assert!(!PeerAddress::check("001:1:22:AA:BB:CC"));
      assert!(!PeerAddress::check("00-11-22-AA-BB-CC"));
      assert!(!PeerAddress::check("00:11:22:AG:BB:CC"));
      assert!(!PeerAddress::check(""));

      assert!(matches!(
         PeerAddress::parse("00:11:22:aa:bb:cc"),
         Err(RfcommError::InvalidAddress(_))
      ));
   }

   #[test]
   fn test_service_short_form() {
      assert_eq!(ServiceId::SERIAL_PORT.short(), 0x1101);
      assert_eq!(
         ServiceId::SERIAL_PORT.to_string(),
         "00001101-0000-1000-8000-00805f9b34fb"
      );

      let parsed: ServiceId = "0000110A-0000-1000-8000-00805F9B34FB".parse().unwrap();
      assert_eq!(parsed.short(), 0x110A);
      assert_eq!(parsed, ServiceId::from_short(0x110A));

      assert!(matches!(
         "not-a-uuid".parse::<ServiceId>(),
         Err(RfcommError::InvalidServiceId(_))
      ));
   }

   #[test]
   fn test_fallback_channel() {
      // 0x110A & 0x1E == 0x0A
      assert_eq!(ServiceId::from_short(0x110A).fallback_channel().get(), 10);
      // Deterministic for the same identifier
      let service = ServiceId::from_short(0x1234);
      assert_eq!(service.fallback_channel(), service.fallback_channel());
      assert_eq!(service.fallback_channel().get(), (0x1234 & CHANNEL_MASK) as u8);
      // Mask yielding 0 is clamped to the top channel
      assert_eq!(ServiceId::SERIAL_PORT.fallback_channel(), Channel::MAX);
   }

   #[test]
   fn test_channel_range() {
      assert!(Channel::new(0).is_none());
      assert!(Channel::new(-1).is_none());
      assert!(Channel::new(31).is_none());
      assert_eq!(Channel::new(1), Some(Channel::MIN));
      assert_eq!(Channel::new(30), Some(Channel::MAX));
      assert_eq!(Channel::try_from(0u8), Err(InvalidChannel(0)));
   }
}

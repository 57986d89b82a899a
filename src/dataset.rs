//! Raw training items and the MessagePack shard reader.
//!
//! A shard is a plain concatenation of msgpack maps with the keys `image`, `id`,
//! `latitude` and `longitude`. Any key may be missing; extra keys are ignored.
//! Every top-level value is consumed whole, so an entry with a wrongly typed field
//! (or one that is not a map at all) comes out as a [`RawItem`] marked
//! `malformed` and the reader stays in step with the stream.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize, Serializer};
use tracing::warn;

use crate::error::{GeoError, Result};

/// One dataset entry before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawItem {
    #[serde(serialize_with = "serialize_bytes")]
    pub image: Option<Vec<u8>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(serialize_with = "serialize_bytes")]
    pub id: Option<Vec<u8>>,
    /// First field that could not be read, `"item"` when the entry is not a map
    #[serde(skip_serializing)]
    pub malformed: Option<&'static str>,
}

impl RawItem {
    pub fn new(image: Vec<u8>, latitude: f64, longitude: f64, id: &str) -> Self {
        Self {
            image: Some(image),
            latitude: Some(latitude),
            longitude: Some(longitude),
            id: Some(id.as_bytes().to_vec()),
            malformed: None,
        }
    }

    fn mark(&mut self, field: &'static str) {
        self.malformed.get_or_insert(field);
    }
}

/// Byte fields are written back as msgpack `bin`.
fn serialize_bytes<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(bytes) => serializer.serialize_bytes(bytes),
        None => serializer.serialize_none(),
    }
}

/// Streams [`RawItem`]s out of a msgpack shard.
///
/// Framing and I/O problems end the stream with [`GeoError::Dataset`]; a clean end
/// of file or a truncated last entry ends it quietly.
pub struct ShardReader<R: Read> {
    de: rmp_serde::Deserializer<rmp_serde::decode::ReadReader<R>>,
    done: bool,
}

impl ShardReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> ShardReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            de: rmp_serde::Deserializer::new(reader),
            done: false,
        }
    }
}

impl<R: Read> Iterator for ShardReader<R> {
    type Item = Result<RawItem>;

    fn next(&mut self) -> Option<Self::Item> {
        use rmp_serde::decode::Error as DecodeError;

        if self.done {
            return None;
        }
        match RawItem::deserialize(&mut self.de) {
            Ok(item) => {
                if let Some(field) = item.malformed {
                    warn!("Shard entry has a malformed {}", field);
                }
                Some(Ok(item))
            }
            Err(DecodeError::InvalidMarkerRead(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.done = true;
                None
            }
            Err(DecodeError::InvalidDataRead(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("Shard ends inside an item, dropping the truncated tail");
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(GeoError::Dataset(e.to_string())))
            }
        }
    }
}

/// Type-tolerant decoding of shard entries.
mod lenient {
    use std::fmt;

    use serde::de::{self, IgnoredAny, MapAccess, SeqAccess, Visitor};
    use serde::{Deserialize, Deserializer};

    use super::RawItem;

    /// Any msgpack value, reduced to what a shard field can be.
    enum Loose {
        Nil,
        Bytes(Vec<u8>),
        Number(f64),
        Other,
    }

    impl Loose {
        /// `bin`, `str` or an array of small ints.
        fn into_bytes(self) -> Option<Option<Vec<u8>>> {
            match self {
                Loose::Nil => Some(None),
                Loose::Bytes(bytes) => Some(Some(bytes)),
                Loose::Number(_) | Loose::Other => None,
            }
        }

        fn into_number(self) -> Option<Option<f64>> {
            match self {
                Loose::Nil => Some(None),
                Loose::Number(n) => Some(Some(n)),
                Loose::Bytes(_) | Loose::Other => None,
            }
        }
    }

    impl<'de> Deserialize<'de> for Loose {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(LooseVisitor)
        }
    }

    struct LooseVisitor;

    impl<'de> Visitor<'de> for LooseVisitor {
        type Value = Loose;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("any msgpack value")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Loose, E> {
            Ok(Loose::Nil)
        }

        fn visit_none<E: de::Error>(self) -> Result<Loose, E> {
            Ok(Loose::Nil)
        }

        fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Loose, D::Error> {
            Loose::deserialize(deserializer)
        }

        fn visit_bool<E: de::Error>(self, _: bool) -> Result<Loose, E> {
            Ok(Loose::Other)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Loose, E> {
            Ok(Loose::Number(v as f64))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Loose, E> {
            Ok(Loose::Number(v as f64))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Loose, E> {
            Ok(Loose::Number(v))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Loose, E> {
            Ok(Loose::Bytes(v.as_bytes().to_vec()))
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Loose, E> {
            Ok(Loose::Bytes(v.into_bytes()))
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Loose, E> {
            Ok(Loose::Bytes(v.to_vec()))
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Loose, E> {
            Ok(Loose::Bytes(v))
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Loose, A::Error> {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            let mut all_bytes = true;
            while let Some(element) = seq.next_element::<Loose>()? {
                match element {
                    Loose::Number(n) if all_bytes && n.fract() == 0.0 && (0.0..=255.0).contains(&n) => {
                        bytes.push(n as u8)
                    }
                    _ => all_bytes = false,
                }
            }
            Ok(if all_bytes { Loose::Bytes(bytes) } else { Loose::Other })
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Loose, A::Error> {
            while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
            Ok(Loose::Other)
        }
    }

    impl<'de> Deserialize<'de> for RawItem {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(ItemVisitor)
        }
    }

    struct ItemVisitor;

    impl ItemVisitor {
        fn not_a_map() -> RawItem {
            let mut item = RawItem::default();
            item.mark("item");
            item
        }
    }

    impl<'de> Visitor<'de> for ItemVisitor {
        type Value = RawItem;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a shard entry")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawItem, A::Error> {
            let mut item = RawItem::default();
            while let Some(key) = map.next_key::<Loose>()? {
                let key = match key {
                    Loose::Bytes(key) => key,
                    _ => {
                        map.next_value::<IgnoredAny>()?;
                        continue;
                    }
                };
                match key.as_slice() {
                    b"image" => match map.next_value::<Loose>()?.into_bytes() {
                        Some(image) => item.image = image,
                        None => item.mark("image"),
                    },
                    b"id" => match map.next_value::<Loose>()?.into_bytes() {
                        Some(id) => item.id = id,
                        None => item.mark("id"),
                    },
                    b"latitude" => match map.next_value::<Loose>()?.into_number() {
                        Some(latitude) => item.latitude = latitude,
                        None => item.mark("latitude"),
                    },
                    b"longitude" => match map.next_value::<Loose>()?.into_number() {
                        Some(longitude) => item.longitude = longitude,
                        None => item.mark("longitude"),
                    },
                    _ => {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
            }
            Ok(item)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RawItem, A::Error> {
            while seq.next_element::<IgnoredAny>()?.is_some() {}
            Ok(Self::not_a_map())
        }

        fn visit_unit<E: de::Error>(self) -> Result<RawItem, E> {
            Ok(Self::not_a_map())
        }

        fn visit_bool<E: de::Error>(self, _: bool) -> Result<RawItem, E> {
            Ok(Self::not_a_map())
        }

        fn visit_i64<E: de::Error>(self, _: i64) -> Result<RawItem, E> {
            Ok(Self::not_a_map())
        }

        fn visit_u64<E: de::Error>(self, _: u64) -> Result<RawItem, E> {
            Ok(Self::not_a_map())
        }

        fn visit_f64<E: de::Error>(self, _: f64) -> Result<RawItem, E> {
            Ok(Self::not_a_map())
        }

        fn visit_str<E: de::Error>(self, _: &str) -> Result<RawItem, E> {
            Ok(Self::not_a_map())
        }

        fn visit_bytes<E: de::Error>(self, _: &[u8]) -> Result<RawItem, E> {
            Ok(Self::not_a_map())
        }
    }
}

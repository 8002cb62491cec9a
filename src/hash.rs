use serde_json::Value;

/// A 32-byte BLAKE3 hash identifying the resolved inputs of a call node.
///
/// Two call nodes anywhere in the graph that compute equal fingerprints are
/// guaranteed to observe the same cache entry, so the fingerprint must cover
/// every semantically relevant input of the call. The hash is computed over
/// a canonical JSON serialization, which makes it insensitive to object key
/// order but sensitive to array order and value types.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint([u8; 32]);

impl<T> From<T> for Fingerprint
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Fingerprint(value.into())
    }
}

impl Fingerprint {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Fingerprints a call key by hashing its canonical serialization.
    pub fn of_key(key: &Value) -> Self {
        let mut buffer = Vec::new();
        write_canonical(key, &mut buffer);
        Self::hash(buffer)
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }

        Some(Fingerprint(bytes))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Writes JSON with recursively sorted object keys, so that key order in the
/// source document never affects the fingerprint.
fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key).expect("JSON string serialization failed");
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        other => {
            serde_json::to_writer(&mut *out, other).expect("JSON scalar serialization failed");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_fingerprint() {
        let a: Value =
            serde_json::from_str(r#"{"url":"x","method":"GET","headers":{"a":1,"b":2}}"#).unwrap();
        let b: Value =
            serde_json::from_str(r#"{"headers":{"b":2,"a":1},"method":"GET","url":"x"}"#).unwrap();
        assert_eq!(Fingerprint::of_key(&a), Fingerprint::of_key(&b));
    }

    #[test]
    fn array_order_affects_fingerprint() {
        let a = json!({"tools": ["search", "fetch"]});
        let b = json!({"tools": ["fetch", "search"]});
        assert_ne!(Fingerprint::of_key(&a), Fingerprint::of_key(&b));
    }

    #[test]
    fn value_changes_affect_fingerprint() {
        let a = json!({"prompt": "summarize", "model": "m1"});
        let b = json!({"prompt": "summarize", "model": "m2"});
        assert_ne!(Fingerprint::of_key(&a), Fingerprint::of_key(&b));
    }

    #[test]
    fn hex_round_trip() {
        let fp = Fingerprint::of_key(&json!({"a": 1}));
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }
}

use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid MAC address: {input}")]
pub struct InvalidMac {
    pub input: String,
}

/// Hardware address used as a wake-on-LAN hint. Accepts `AA:BB:CC:DD:EE:FF`,
/// `AA-BB-CC-DD-EE-FF`, or 12 bare hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = InvalidMac;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let hex: String = input
            .chars()
            .filter(|ch| *ch != ':' && *ch != '-')
            .collect();
        if hex.len() != 12 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(InvalidMac {
                input: input.to_string(),
            });
        }
        let mut octets = [0u8; 6];
        for (index, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16).map_err(|_| {
                InvalidMac {
                    input: input.to_string(),
                }
            })?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, f] = self.0;
        write!(formatter, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{f:02X}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_accepted_forms() {
        let expected = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        for form in ["AA:BB:CC:DD:EE:FF", "AA-BB-CC-DD-EE-FF", "AABBCCDDEEFF"] {
            let mac: MacAddress = form.parse().unwrap();
            assert_eq!(mac.octets(), expected, "form {form}");
        }
    }

    #[test]
    fn parses_lowercase() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn rejects_wrong_lengths_and_garbage() {
        for bad in ["AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:FF:00", "ZZ:BB:CC:DD:EE:FF", ""] {
            assert!(bad.parse::<MacAddress>().is_err(), "input {bad:?}");
        }
    }
}

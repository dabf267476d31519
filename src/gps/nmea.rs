//! NMEA 0183 sentence validation and decoding
//!
//! Sentences are first validated (leading `$`, minimum length, optional
//! `*hh` XOR checksum), then split into comma-separated fields and decoded
//! into a typed [`Sentence`]. Any talker prefix is accepted (`GP`, `GN`,
//! `GL`, ...); only the three-letter sentence code selects the decoder.
//!
//! Individual numeric fields that fail to parse decode as `None`, and
//! [`Sentence::apply`] leaves the matching `GpsFix` field untouched, so one
//! garbled field never erases good state.

use thiserror::Error;

use crate::core::{GpsFix, KNOTS_TO_KMH};

/// Shortest string that can hold `$` plus a sentence address
pub const MIN_SENTENCE_LEN: usize = 5;

const GGA_MIN_FIELDS: usize = 15;
const RMC_MIN_FIELDS: usize = 12;
const GSV_MIN_FIELDS: usize = 4;
const GSA_MIN_FIELDS: usize = 18;

/// Errors raised while validating or decoding a sentence
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NmeaError {
    #[error("Invalid NMEA sentence: {reason}")]
    InvalidSentence { reason: String },
    #[error("Checksum mismatch: expected {expected:02X}, computed {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("Unsupported sentence type {sentence}")]
    Unsupported { sentence: String },
    #[error("{sentence} has {found} fields, at least {required} required")]
    TooFewFields {
        sentence: String,
        required: usize,
        found: usize,
    },
}

pub type NmeaResult<T> = Result<T, NmeaError>;

/// XOR of every byte in `data`
pub fn nmea_checksum(data: &str) -> u8 {
    data.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Append `*hh` to a `$`-prefixed sentence body
pub fn with_checksum(body: &str) -> String {
    let data = body.strip_prefix('$').unwrap_or(body);
    format!("${}*{:02X}", data, nmea_checksum(data))
}

fn invalid(reason: &str) -> NmeaError {
    NmeaError::InvalidSentence {
        reason: reason.to_string(),
    }
}

/// Validate framing and checksum, returning the sentence body between `$` and `*`
pub fn validate_sentence(line: &str) -> NmeaResult<&str> {
    let sentence = line.trim_end_matches(['\r', '\n']);
    if !sentence.starts_with('$') {
        return Err(invalid("missing '$' prefix"));
    }
    if sentence.len() < MIN_SENTENCE_LEN {
        return Err(invalid("too short"));
    }

    let body = &sentence[1..];
    let mut pieces = body.split('*');
    let data = pieces.next().unwrap_or("");
    let checksum = match (pieces.next(), pieces.next()) {
        (None, _) => return Ok(data),
        (Some(hex), None) => hex,
        (Some(_), Some(_)) => return Err(invalid("more than one '*'")),
    };

    if checksum.len() != 2 {
        return Err(invalid("checksum must be two hex digits"));
    }
    let expected = u8::from_str_radix(checksum, 16).map_err(|_| invalid("non-hex checksum"))?;
    let actual = nmea_checksum(data);
    if expected != actual {
        return Err(NmeaError::ChecksumMismatch { expected, actual });
    }
    Ok(data)
}

/// True when the line is a well-formed sentence with a matching checksum (if any)
pub fn is_valid_nmea(line: &str) -> bool {
    validate_sentence(line).is_ok()
}

/// Decode `DDMM.MMMM` (`degree_digits` = 2) or `DDDMM.MMMM` (3) plus hemisphere
pub fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if value.is_empty() || hemisphere.is_empty() {
        return None;
    }
    let degrees: f64 = value.get(..degree_digits)?.parse().ok()?;
    let minutes: f64 = value.get(degree_digits..)?.parse().ok()?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "S" | "W" => Some(-decimal),
        _ => Some(decimal),
    }
}

fn field<'a>(parts: &[&'a str], index: usize) -> &'a str {
    parts.get(index).copied().unwrap_or("")
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

/// GGA: fix data
#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub time: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fix_quality: Option<u8>,
    pub satellites: Option<u32>,
    pub hdop: Option<f64>,
    /// Only present when the units field is exactly `M`
    pub altitude: Option<f64>,
}

/// RMC: recommended minimum data
#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub time: Option<String>,
    pub date: Option<String>,
    pub active: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub course_deg: Option<f64>,
}

/// GSV: satellites in view
#[derive(Debug, Clone, PartialEq)]
pub struct Gsv {
    pub satellites_in_view: Option<u32>,
}

/// GSA: DOP and active satellites
#[derive(Debug, Clone, PartialEq)]
pub struct Gsa {
    pub fix_type: Option<u8>,
    pub pdop: Option<f64>,
    pub hdop: Option<f64>,
}

/// A decoded sentence of one of the supported types
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(Gga),
    Rmc(Rmc),
    Gsv(Gsv),
    Gsa(Gsa),
}

impl Sentence {
    /// Three-letter sentence code
    pub fn kind(&self) -> &'static str {
        match self {
            Sentence::Gga(_) => "GGA",
            Sentence::Rmc(_) => "RMC",
            Sentence::Gsv(_) => "GSV",
            Sentence::Gsa(_) => "GSA",
        }
    }

    /// Merge decoded fields into the fix state
    pub fn apply(&self, fix: &mut GpsFix) {
        match self {
            Sentence::Gga(gga) => {
                set_if_some(&mut fix.utc_time, gga.time.clone());
                set_if_some(&mut fix.latitude, gga.latitude);
                set_if_some(&mut fix.longitude, gga.longitude);
                if let Some(quality) = gga.fix_quality {
                    fix.fix_quality = quality;
                }
                if let Some(satellites) = gga.satellites {
                    fix.satellites = satellites;
                }
                if let Some(hdop) = gga.hdop {
                    fix.hdop = hdop;
                }
                set_if_some(&mut fix.altitude, gga.altitude);
            }
            Sentence::Rmc(rmc) => {
                set_if_some(&mut fix.utc_time, rmc.time.clone());
                set_if_some(&mut fix.utc_date, rmc.date.clone());
                if rmc.active {
                    set_if_some(&mut fix.latitude, rmc.latitude);
                    set_if_some(&mut fix.longitude, rmc.longitude);
                    set_if_some(&mut fix.speed_kmh, rmc.speed_kmh);
                    set_if_some(&mut fix.course_deg, rmc.course_deg);
                }
            }
            Sentence::Gsv(gsv) => {
                // GGA is authoritative for the satellite count
                if fix.satellites == 0 {
                    if let Some(in_view) = gsv.satellites_in_view {
                        fix.satellites = in_view;
                    }
                }
            }
            Sentence::Gsa(gsa) => {
                if let Some(fix_type) = gsa.fix_type {
                    fix.fix_type = fix_type;
                }
                if let Some(pdop) = gsa.pdop {
                    fix.pdop = pdop;
                }
                if let Some(hdop) = gsa.hdop {
                    fix.hdop = hdop;
                }
            }
        }
    }
}

fn set_if_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn require_fields(sentence: &str, parts: &[&str], required: usize) -> NmeaResult<()> {
    if parts.len() < required {
        return Err(NmeaError::TooFewFields {
            sentence: sentence.to_string(),
            required,
            found: parts.len(),
        });
    }
    Ok(())
}

/// Validate and decode one line
pub fn parse_sentence(line: &str) -> NmeaResult<Sentence> {
    let data = validate_sentence(line)?;
    let parts: Vec<&str> = data.split(',').collect();
    let address = parts[0];
    let code = match address.get(2..) {
        Some(code) if address.len() == 5 => code,
        _ => {
            return Err(NmeaError::Unsupported {
                sentence: address.to_string(),
            })
        }
    };

    match code {
        "GGA" => {
            require_fields(address, &parts, GGA_MIN_FIELDS)?;
            let altitude = if field(&parts, 10) == "M" {
                number(field(&parts, 9))
            } else {
                None
            };
            Ok(Sentence::Gga(Gga {
                time: non_empty(field(&parts, 1)),
                latitude: parse_coordinate(field(&parts, 2), field(&parts, 3), 2),
                longitude: parse_coordinate(field(&parts, 4), field(&parts, 5), 3),
                fix_quality: number(field(&parts, 6)),
                satellites: number(field(&parts, 7)),
                hdop: number(field(&parts, 8)),
                altitude,
            }))
        }
        "RMC" => {
            require_fields(address, &parts, RMC_MIN_FIELDS)?;
            Ok(Sentence::Rmc(Rmc {
                time: non_empty(field(&parts, 1)),
                active: field(&parts, 2) == "A",
                latitude: parse_coordinate(field(&parts, 3), field(&parts, 4), 2),
                longitude: parse_coordinate(field(&parts, 5), field(&parts, 6), 3),
                speed_kmh: number::<f64>(field(&parts, 7)).map(|knots| knots * KNOTS_TO_KMH),
                course_deg: number(field(&parts, 8)),
                date: non_empty(field(&parts, 9)),
            }))
        }
        "GSV" => {
            require_fields(address, &parts, GSV_MIN_FIELDS)?;
            Ok(Sentence::Gsv(Gsv {
                satellites_in_view: number(field(&parts, 3)),
            }))
        }
        "GSA" => {
            require_fields(address, &parts, GSA_MIN_FIELDS)?;
            Ok(Sentence::Gsa(Gsa {
                fix_type: number(field(&parts, 2)),
                pdop: number(field(&parts, 15)),
                hdop: number(field(&parts, 16)),
            }))
        }
        _ => Err(NmeaError::Unsupported {
            sentence: address.to_string(),
        }),
    }
}

/// Sentence counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    pub parsed: u64,
    pub rejected: u64,
    pub unsupported: u64,
}

/// Stateful front end feeding sentences into a [`GpsFix`]
#[derive(Debug, Default)]
pub struct NmeaParser {
    stats: ParserStats,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `line` and merge it into `fix`
    ///
    /// Unsupported sentence types are counted but are not errors for the
    /// caller to report; everything else that fails is.
    pub fn process_line(&mut self, line: &str, fix: &mut GpsFix) -> NmeaResult<Option<&'static str>> {
        match parse_sentence(line) {
            Ok(sentence) => {
                sentence.apply(fix);
                self.stats.parsed += 1;
                Ok(Some(sentence.kind()))
            }
            Err(NmeaError::Unsupported { .. }) => {
                self.stats.unsupported += 1;
                Ok(None)
            }
            Err(e) => {
                self.stats.rejected += 1;
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const GGA_SW: &str = "$GPGGA,123520,4807.038,S,01131.000,W,1,02,0.9,545.4,M,46.9,M,,*48";
    const RMC_ACTIVE: &str =
        "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
    const RMC_VOID: &str = "$GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*7D";
    const GSA: &str = "$GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1*39";
    const GSV: &str = "$GPGSV,2,1,08,01,40,083,46,02,17,308,41,12,07,344,39,14,22,228,45*75";

    #[test]
    fn test_checksum_validation() {
        assert!(is_valid_nmea(GGA));
        assert!(is_valid_nmea(RMC_ACTIVE));
        assert!(is_valid_nmea(GSA));
        assert!(is_valid_nmea(GSV));
        assert!(is_valid_nmea(&format!("{}\r\n", GGA)));

        let tampered = GGA.replace("4807.038", "4807.039");
        assert!(matches!(
            validate_sentence(&tampered),
            Err(NmeaError::ChecksumMismatch { expected: 0x47, .. })
        ));
    }

    #[test]
    fn test_framing_rules() {
        assert!(!is_valid_nmea("GPGGA,123519*47"));
        assert!(!is_valid_nmea("$GP"));
        assert!(!is_valid_nmea("$GPGGA,1*ZZ"));
        assert!(!is_valid_nmea("$GPGGA*47*47"));
        // No checksum present is accepted
        assert!(is_valid_nmea("$GPGSV,1,1,04"));
    }

    #[test]
    fn test_with_checksum_matches_known_sentence() {
        let body = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,";
        assert_eq!(with_checksum(body), GGA);
    }

    #[test]
    fn test_parse_gga() {
        let mut fix = GpsFix::default();
        parse_sentence(GGA).unwrap().apply(&mut fix);

        assert!((fix.latitude.unwrap() - 48.1173).abs() < 1e-4);
        assert!((fix.longitude.unwrap() - 11.516_666).abs() < 1e-5);
        assert_eq!(fix.fix_quality, 1);
        assert_eq!(fix.satellites, 8);
        assert_eq!(fix.hdop, 0.9);
        assert_eq!(fix.altitude, Some(545.4));
        assert_eq!(fix.utc_time.as_deref(), Some("123519"));
    }

    #[test]
    fn test_parse_gga_southern_western_hemisphere() {
        let mut fix = GpsFix::default();
        parse_sentence(GGA_SW).unwrap().apply(&mut fix);
        assert!(fix.latitude.unwrap() < 0.0);
        assert!(fix.longitude.unwrap() < 0.0);
        assert_eq!(fix.satellites, 2);
    }

    #[test]
    fn test_gga_altitude_requires_meter_units() {
        let line = with_checksum("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,F,46.9,M,,");
        let mut fix = GpsFix::default();
        parse_sentence(&line).unwrap().apply(&mut fix);
        assert_eq!(fix.altitude, None);
        assert_eq!(fix.satellites, 8);
    }

    #[test]
    fn test_bad_numeric_field_keeps_previous_value() {
        let mut fix = GpsFix::default();
        parse_sentence(GGA).unwrap().apply(&mut fix);

        let garbled = with_checksum("$GPGGA,123521,4807.038,N,01131.000,E,1,xx,0.9,545.4,M,46.9,M,,");
        parse_sentence(&garbled).unwrap().apply(&mut fix);
        assert_eq!(fix.satellites, 8);
        assert_eq!(fix.utc_time.as_deref(), Some("123521"));
    }

    #[test]
    fn test_parse_rmc_active_and_void() {
        let mut fix = GpsFix::default();
        parse_sentence(RMC_VOID).unwrap().apply(&mut fix);
        assert!(fix.latitude.is_none());
        assert_eq!(fix.utc_date.as_deref(), Some("230394"));

        parse_sentence(RMC_ACTIVE).unwrap().apply(&mut fix);
        assert!((fix.latitude.unwrap() - 48.1173).abs() < 1e-4);
        assert!((fix.speed_kmh.unwrap() - 22.4 * 1.852).abs() < 1e-9);
        assert_eq!(fix.course_deg, Some(84.4));
    }

    #[test]
    fn test_parse_gsa() {
        let mut fix = GpsFix::default();
        parse_sentence(GSA).unwrap().apply(&mut fix);
        assert_eq!(fix.fix_type, 3);
        assert_eq!(fix.pdop, 2.5);
        assert_eq!(fix.hdop, 1.3);
    }

    #[test]
    fn test_gsv_only_fills_missing_satellite_count() {
        let mut fix = GpsFix::default();
        parse_sentence(GSV).unwrap().apply(&mut fix);
        assert_eq!(fix.satellites, 8);

        let mut fix = GpsFix::default();
        parse_sentence(GGA_SW).unwrap().apply(&mut fix);
        parse_sentence(GSV).unwrap().apply(&mut fix);
        assert_eq!(fix.satellites, 2);
    }

    #[test]
    fn test_other_talkers_accepted() {
        let line = with_checksum("$GNGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        assert!(matches!(parse_sentence(&line), Ok(Sentence::Gga(_))));
    }

    #[test]
    fn test_too_few_fields() {
        let line = with_checksum("$GPGSA,A,3,04,05");
        assert!(matches!(
            parse_sentence(&line),
            Err(NmeaError::TooFewFields { required: 18, found: 5, .. })
        ));
    }

    #[test]
    fn test_parser_counts_sentences() {
        let mut parser = NmeaParser::new();
        let mut fix = GpsFix::default();

        assert_eq!(parser.process_line(GGA, &mut fix), Ok(Some("GGA")));
        assert_eq!(parser.process_line(&with_checksum("$GPVTG,,T,,M"), &mut fix), Ok(None));
        assert!(parser.process_line("garbage", &mut fix).is_err());

        let stats = parser.stats();
        assert_eq!(stats.parsed, 1);
        assert_eq!(stats.unsupported, 1);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn test_parse_coordinate() {
        assert!((parse_coordinate("4807.038", "N", 2).unwrap() - 48.1173).abs() < 1e-4);
        assert!(parse_coordinate("01131.000", "W", 3).unwrap() < 0.0);
        assert_eq!(parse_coordinate("", "N", 2), None);
        assert_eq!(parse_coordinate("48xx.038", "N", 2), None);
    }

    proptest! {
        #[test]
        fn prop_single_character_flip_breaks_checksum(
            index in 1usize..60,
            replacement in proptest::char::range('0', 'Z'),
        ) {
            let data_end = GGA.find('*').unwrap();
            let index = index.min(data_end - 1).max(1);
            let original = GGA.as_bytes()[index] as char;
            prop_assume!(original != replacement);

            let mut tampered = String::with_capacity(GGA.len());
            tampered.push_str(&GGA[..index]);
            tampered.push(replacement);
            tampered.push_str(&GGA[index + 1..]);
            prop_assert!(!is_valid_nmea(&tampered));
        }

        #[test]
        fn prop_generated_checksum_validates(body in "[A-Z0-9.,]{5,60}") {
            let sentence = with_checksum(&format!("${}", body));
            prop_assert!(is_valid_nmea(&sentence));
        }
    }
}

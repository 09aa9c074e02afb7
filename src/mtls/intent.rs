//! Intent extraction from client certificates.
//!
//! Client certificates carry the requested authorization scope as an
//! `otherName` entry in the Subject Alternative Name extension:
//!
//! ```text
//! SubjectAltName ::= SEQUENCE {
//!     [0] otherName {              -- context-specific, constructed
//!         type-id  OBJECT IDENTIFIER,
//!         value    [0] EXPLICIT UTF8String   -- the intent
//!     }
//!     ...
//! }
//! ```
//!
//! Only the *first* `GeneralName` is considered. The extension value is
//! attacker controlled, so every structural step is checked and reported
//! as a distinct error instead of being handed to a generic SAN decoder.

use rustls::pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::asn1_rs::{Any, Class, FromDer, Oid, Tag};
use x509_parser::oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME;

use crate::{Error, Result};

/// Universal, constructed SEQUENCE identifier octet.
const SEQUENCE_TAG_BYTE: u8 = 0x30;

/// Intent recovered from a client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    /// The authorization scope requested by the certificate holder.
    pub value: String,
    /// Dotted `otherName` type-id, e.g. `"2.5.29.17"`.
    pub type_id: String,
    /// The certificate the intent was read from.
    pub certificate: CertificateDer<'static>,
}

/// Decoded `otherName` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherName {
    /// Dotted type-id.
    pub type_id: String,
    /// UTF-8 value.
    pub value: String,
}

/// Scan `chains` (each ordered leaf → root) for the first certificate with a
/// Subject Alternative Name extension and decode its intent.
///
/// Certificates that are not valid X.509 are skipped.
///
/// # Errors
///
/// - [`Error::NoIntentPresent`] when no certificate has a SAN extension
/// - [`Error::MalformedExtension`] / [`Error::NoOtherName`] when the SAN of
///   the selected certificate does not have the expected structure
pub fn extract_intent(chains: &[&[CertificateDer<'_>]]) -> Result<Intent> {
    for chain in chains {
        for cert in *chain {
            let Ok((_, parsed)) = X509Certificate::from_der(cert.as_ref()) else {
                continue;
            };
            let Some(san) = parsed
                .extensions()
                .iter()
                .find(|ext| ext.oid == OID_X509_EXT_SUBJECT_ALT_NAME)
            else {
                continue;
            };

            let other = decode_other_name(san.value)?;
            return Ok(Intent {
                value: other.value,
                type_id: other.type_id,
                certificate: cert.clone().into_owned(),
            });
        }
    }

    Err(Error::NoIntentPresent)
}

/// Decode the first `GeneralName` of a raw SAN extension value as an
/// `otherName` carrying a UTF-8 string.
///
/// # Errors
///
/// [`Error::MalformedExtension`] for undecodable or mis-shaped DER,
/// [`Error::NoOtherName`] when the first entry is not `otherName`.
pub fn decode_other_name(raw: &[u8]) -> Result<OtherName> {
    // 1. outer GeneralNames SEQUENCE
    let (_, outer) = Any::from_der(raw).map_err(malformed)?;
    if outer.header.class() != Class::Universal
        || outer.header.tag() != Tag::Sequence
        || !outer.header.is_constructed()
    {
        return Err(Error::MalformedExtension(format!(
            "expected SEQUENCE, found {:?} tag {}",
            outer.header.class(),
            outer.header.tag().0
        )));
    }

    // 2. first GeneralName must be [0] otherName
    let names = outer.as_bytes();
    let (rest, first) = Any::from_der(names).map_err(malformed)?;
    if first.header.class() != Class::ContextSpecific
        || first.header.tag() != Tag(0)
        || !first.header.is_constructed()
    {
        return Err(Error::NoOtherName);
    }

    // 3. re-tag the implicit [0] as a SEQUENCE and decode OtherName
    let mut encoded = names[..names.len() - rest.len()].to_vec();
    encoded[0] = SEQUENCE_TAG_BYTE;
    let (_, seq) = Any::from_der(&encoded).map_err(malformed)?;

    let (rest, type_id) = Oid::from_der(seq.as_bytes()).map_err(malformed)?;
    let (_, explicit) = Any::from_der(rest).map_err(malformed)?;
    if explicit.header.class() != Class::ContextSpecific
        || explicit.header.tag() != Tag(0)
        || !explicit.header.is_constructed()
    {
        return Err(Error::MalformedExtension(
            "otherName value is not [0] EXPLICIT".to_string(),
        ));
    }

    // 4. the explicit value is the UTF8String intent
    let (_, value) = Any::from_der(explicit.as_bytes()).map_err(malformed)?;
    if value.header.class() != Class::Universal || value.header.tag() != Tag::Utf8String {
        return Err(Error::MalformedExtension(format!(
            "otherName value is not a UTF8String (tag {})",
            value.header.tag().0
        )));
    }
    let value = std::str::from_utf8(value.as_bytes())
        .map_err(|e| Error::MalformedExtension(format!("intent is not UTF-8: {e}")))?;

    Ok(OtherName {
        type_id: type_id.to_id_string(),
        value: value.to_owned(),
    })
}

fn malformed(e: impl std::fmt::Display) -> Error {
    Error::MalformedExtension(e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::cert_manager::{CaParams, CertGenerator, INTENT_TYPE_ID};
    use rcgen::string::Ia5String;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, OtherNameValue, SanType};

    // ── helpers ──────────────────────────────────────────────────────────────

    /// DER TLV with a short-form length.
    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        assert!(content.len() < 128);
        let mut out = vec![tag, u8::try_from(content.len()).unwrap()];
        out.extend_from_slice(content);
        out
    }

    /// Hand-built SAN value: SEQUENCE { [0] { OID 2.5.29.17, [0] { UTF8String } } }
    fn san_with_value(value_tlv: &[u8]) -> Vec<u8> {
        let oid = tlv(0x06, &[0x55, 0x1D, 0x11]);
        let explicit = tlv(0xA0, value_tlv);
        let other_name = tlv(0xA0, &[oid, explicit].concat());
        tlv(0x30, &other_name)
    }

    fn san_with_intent(intent: &str) -> Vec<u8> {
        san_with_value(&tlv(0x0C, intent.as_bytes()))
    }

    fn self_signed(sans: Vec<SanType>) -> CertificateDer<'static> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "intent-test");
        params.distinguished_name = dn;
        params.subject_alt_names = sans;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().clone()
    }

    fn intent_san(intent: &str) -> SanType {
        SanType::OtherName((
            INTENT_TYPE_ID.to_vec(),
            OtherNameValue::Utf8String(intent.to_string()),
        ))
    }

    // ── decode_other_name: well-formed input ─────────────────────────────────

    #[test]
    fn decodes_hand_built_other_name() {
        let other = decode_other_name(&san_with_intent("read:orders")).unwrap();
        assert_eq!(other.value, "read:orders");
        assert_eq!(other.type_id, "2.5.29.17");
    }

    #[test]
    fn decodes_empty_intent() {
        let other = decode_other_name(&san_with_intent("")).unwrap();
        assert_eq!(other.value, "");
    }

    #[test]
    fn trailing_general_names_are_ignored() {
        // GIVEN: otherName followed by a DNS name
        let oid = tlv(0x06, &[0x55, 0x1D, 0x11]);
        let explicit = tlv(0xA0, &tlv(0x0C, b"analytics"));
        let other_name = tlv(0xA0, &[oid, explicit].concat());
        let dns = tlv(0x82, b"db.local");
        let raw = tlv(0x30, &[other_name, dns].concat());
        // THEN: the first entry wins
        assert_eq!(decode_other_name(&raw).unwrap().value, "analytics");
    }

    // ── decode_other_name: malformed input ───────────────────────────────────

    #[test]
    fn wrong_outer_tag_is_malformed() {
        // GIVEN: SET instead of SEQUENCE
        let mut raw = san_with_intent("x");
        raw[0] = 0x31;
        let err = decode_other_name(&raw).unwrap_err();
        assert!(matches!(err, Error::MalformedExtension(_)), "{err}");
    }

    #[test]
    fn dns_name_first_is_no_other_name() {
        let raw = tlv(0x30, &tlv(0x82, b"example.com"));
        assert!(matches!(
            decode_other_name(&raw).unwrap_err(),
            Error::NoOtherName
        ));
    }

    #[test]
    fn primitive_context_zero_is_no_other_name() {
        let raw = tlv(0x30, &tlv(0x80, b"abc"));
        assert!(matches!(
            decode_other_name(&raw).unwrap_err(),
            Error::NoOtherName
        ));
    }

    #[test]
    fn truncated_bytes_are_malformed() {
        let raw = san_with_intent("read:orders");
        for cut in [1, 3, raw.len() - 1] {
            let err = decode_other_name(&raw[..raw.len() - cut]).unwrap_err();
            assert!(matches!(err, Error::MalformedExtension(_)), "cut {cut}: {err}");
        }
    }

    #[test]
    fn empty_input_is_malformed() {
        assert!(matches!(
            decode_other_name(&[]).unwrap_err(),
            Error::MalformedExtension(_)
        ));
    }

    #[test]
    fn empty_sequence_is_malformed() {
        assert!(matches!(
            decode_other_name(&[0x30, 0x00]).unwrap_err(),
            Error::MalformedExtension(_)
        ));
    }

    #[test]
    fn non_utf8_string_value_is_malformed() {
        // GIVEN: an IA5String where a UTF8String is required
        let raw = san_with_value(&tlv(0x16, b"read"));
        assert!(matches!(
            decode_other_name(&raw).unwrap_err(),
            Error::MalformedExtension(_)
        ));
    }

    #[test]
    fn invalid_utf8_bytes_are_malformed() {
        let raw = san_with_value(&tlv(0x0C, &[0xFF, 0xFE]));
        let err = decode_other_name(&raw).unwrap_err();
        assert!(err.to_string().contains("UTF-8"), "{err}");
    }

    #[test]
    fn missing_type_id_is_malformed() {
        // GIVEN: otherName whose first element is not an OID
        let other_name = tlv(0xA0, &tlv(0xA0, &tlv(0x0C, b"x")));
        let raw = tlv(0x30, &other_name);
        assert!(matches!(
            decode_other_name(&raw).unwrap_err(),
            Error::MalformedExtension(_)
        ));
    }

    // ── extract_intent over certificates ─────────────────────────────────────

    #[test]
    fn extracts_intent_from_rcgen_other_name() {
        // GIVEN: a certificate issued with an intent otherName
        let der = self_signed(vec![intent_san("read:customers")]);
        // WHEN: extracting
        let intent = extract_intent(&[&[der.clone()]]).unwrap();
        // THEN: intent and certificate returned
        assert_eq!(intent.value, "read:customers");
        assert_eq!(intent.type_id, "2.5.29.17");
        assert_eq!(intent.certificate, der);
    }

    #[test]
    fn certificate_without_san_yields_no_intent() {
        let der = self_signed(vec![]);
        assert!(matches!(
            extract_intent(&[&[der]]).unwrap_err(),
            Error::NoIntentPresent
        ));
    }

    #[test]
    fn empty_chain_yields_no_intent() {
        assert!(matches!(
            extract_intent(&[]).unwrap_err(),
            Error::NoIntentPresent
        ));
        assert!(matches!(
            extract_intent(&[&[]]).unwrap_err(),
            Error::NoIntentPresent
        ));
    }

    #[test]
    fn dns_only_san_yields_no_other_name() {
        let der = self_signed(vec![SanType::DnsName(
            Ia5String::try_from("client.local").unwrap(),
        )]);
        assert!(matches!(
            extract_intent(&[&[der]]).unwrap_err(),
            Error::NoOtherName
        ));
    }

    #[test]
    fn first_certificate_with_san_wins() {
        // GIVEN: chain where the leaf has no SAN but the next cert does
        let leaf = self_signed(vec![]);
        let issuer = self_signed(vec![intent_san("from-issuer")]);
        let intent = extract_intent(&[&[leaf, issuer.clone()]]).unwrap();
        assert_eq!(intent.value, "from-issuer");
        assert_eq!(intent.certificate, issuer);
    }

    #[test]
    fn unparseable_certificates_are_skipped() {
        let garbage = CertificateDer::from(b"not a certificate".to_vec());
        let good = self_signed(vec![intent_san("write:ledger")]);
        let intent = extract_intent(&[&[garbage], &[good]]).unwrap();
        assert_eq!(intent.value, "write:ledger");
    }

    #[test]
    fn issued_client_certificate_round_trips_intent() {
        // GIVEN: a CA-issued client certificate from the generator
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "Intent CA",
            validity_days: 30,
        })
        .unwrap();
        let client = CertGenerator::issue_client("svc-reporting", "read:reports", 1, &ca).unwrap();
        let der = client.cert_der().unwrap();
        // THEN: the intent is recovered
        assert_eq!(extract_intent(&[&[der]]).unwrap().value, "read:reports");
    }
}

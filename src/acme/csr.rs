//! Just enough PKCS#10 parsing to pull the subject CN and subject alternative
//! names out of a finalization request.

use super::ACMEResult;
use crate::types;

fn bad_csr(detail: String) -> types::error::Error {
    types::error::Error {
        error_type: types::error::Type::BadCSR,
        status: 400,
        title: "Bad CSR".to_string(),
        detail,
        sub_problems: vec![],
        instance: None,
        identifier: None,
    }
}

#[derive(asn1::Asn1Read)]
pub struct CertificationRequest<'a> {
    pub info: CertificationRequestInfo<'a>,
    pub signature_algorithm: asn1::Tlv<'a>,
    pub signature: asn1::BitString<'a>,
}

#[derive(asn1::Asn1Read)]
pub struct CertificationRequestInfo<'a> {
    pub version: u8,
    pub subject: asn1::SequenceOf<'a, asn1::SetOf<'a, AttributeTypeAndValue<'a>>>,
    pub spki: asn1::Tlv<'a>,
    #[implicit(0)]
    pub attributes: Option<asn1::SetOf<'a, Attribute<'a>>>,
}

#[derive(asn1::Asn1Read)]
pub struct AttributeTypeAndValue<'a> {
    pub attr_type: asn1::ObjectIdentifier,
    pub value: asn1::Tlv<'a>,
}

#[derive(asn1::Asn1Read)]
pub struct Attribute<'a> {
    pub attr_type: asn1::ObjectIdentifier,
    pub values: asn1::SetOf<'a, asn1::Tlv<'a>>,
}

#[derive(asn1::Asn1Read)]
pub struct Extension<'a> {
    pub extension_id: asn1::ObjectIdentifier,
    #[default(false)]
    pub critical: bool,
    pub value: &'a [u8],
}

#[derive(asn1::Asn1Read)]
pub enum GeneralName<'a> {
    #[implicit(0)]
    OtherName(asn1::Sequence<'a>),
    #[implicit(1)]
    Rfc822Name(asn1::IA5String<'a>),
    #[implicit(2)]
    DnsName(asn1::IA5String<'a>),
    #[implicit(3)]
    X400Address(asn1::Sequence<'a>),
    #[explicit(4)]
    DirectoryName(asn1::Tlv<'a>),
    #[implicit(5)]
    EdiPartyName(asn1::Sequence<'a>),
    #[implicit(6)]
    Uri(asn1::IA5String<'a>),
    #[implicit(7)]
    IpAddress(&'a [u8]),
    #[implicit(8)]
    RegisteredId(asn1::ObjectIdentifier),
}

/// Names asserted by a CSR. DNS names appear in both `sans` and `dns_names`;
/// email and IP SANs only in `sans`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CsrInfo {
    pub common_name: Option<String>,
    pub sans: Vec<String>,
    pub dns_names: Vec<String>,
}

fn directory_string(value: &asn1::Tlv) -> Option<String> {
    if let Ok(s) = value.parse::<asn1::Utf8String>() {
        return Some(s.as_str().to_string());
    }
    if let Ok(s) = value.parse::<asn1::PrintableString>() {
        return Some(s.as_str().to_string());
    }
    if let Ok(s) = value.parse::<asn1::IA5String>() {
        return Some(s.as_str().to_string());
    }
    None
}

pub fn parse(der: &[u8]) -> ACMEResult<CsrInfo> {
    let extension_request_oid = match asn1::ObjectIdentifier::from_string("1.2.840.113549.1.9.14") {
        Some(v) => v,
        None => return Err(internal_server_error!()),
    };
    let san_oid = match asn1::ObjectIdentifier::from_string("2.5.29.17") {
        Some(v) => v,
        None => return Err(internal_server_error!()),
    };
    let cn_oid = match asn1::ObjectIdentifier::from_string("2.5.4.3") {
        Some(v) => v,
        None => return Err(internal_server_error!()),
    };

    let request = match asn1::parse_single::<CertificationRequest>(der) {
        Ok(v) => v,
        Err(err) => {
            return Err(bad_csr(format!("Invalid CSR structure: {}", err)));
        }
    };

    if request.info.version != 0 {
        return Err(bad_csr(format!(
            "Unsupported CSR version {}", request.info.version)));
    }

    let mut info = CsrInfo::default();

    for rdn in request.info.subject.clone() {
        for attribute in rdn {
            if attribute.attr_type == cn_oid {
                match directory_string(&attribute.value) {
                    Some(cn) => {
                        info.common_name = Some(cn);
                    }
                    None => {
                        return Err(bad_csr("Unsupported commonName encoding".to_string()));
                    }
                }
            }
        }
    }

    let attributes = match request.info.attributes {
        Some(v) => v,
        None => return Ok(info),
    };
    for attribute in attributes {
        if attribute.attr_type != extension_request_oid {
            continue;
        }
        for value in attribute.values {
            let extensions = match value.parse::<asn1::SequenceOf<Extension>>() {
                Ok(v) => v,
                Err(err) => {
                    return Err(bad_csr(format!("Invalid extension request: {}", err)));
                }
            };
            for extension in extensions {
                if extension.extension_id != san_oid {
                    continue;
                }
                let names = match asn1::parse_single::<asn1::SequenceOf<GeneralName>>(extension.value) {
                    Ok(v) => v,
                    Err(err) => {
                        return Err(bad_csr(format!(
                            "Invalid subjectAltName extension: {}", err)));
                    }
                };
                for name in names {
                    match name {
                        GeneralName::DnsName(dns) => {
                            info.sans.push(dns.as_str().to_string());
                            info.dns_names.push(dns.as_str().to_string());
                        }
                        GeneralName::Rfc822Name(email) => {
                            info.sans.push(email.as_str().to_string());
                        }
                        GeneralName::IpAddress(addr) => match addr.len() {
                            4 => {
                                let mut octets = [0u8; 4];
                                octets.copy_from_slice(addr);
                                info.sans.push(std::net::Ipv4Addr::from(octets).to_string());
                            }
                            16 => {
                                let mut octets = [0u8; 16];
                                octets.copy_from_slice(addr);
                                info.sans.push(std::net::Ipv6Addr::from(octets).to_string());
                            }
                            _ => {
                                return Err(bad_csr("Invalid IP address SAN".to_string()));
                            }
                        },
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(info)
}

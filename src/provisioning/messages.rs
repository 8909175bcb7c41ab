//! Wire shapes for the fleet provisioning MQTT API.
//!
//! Requests serialize with their field names exactly as the service
//! declares them. Responses are decoded into [`Response`] by looking at which
//! discriminating field is present, then deserialized into the matching shape.

use super::ProvisionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const CREATE_CERTIFICATE_TOPIC: &str = "$aws/certificates/create/json";

/// Length of the file name prefix taken from a certificate id.
pub const FILE_PREFIX_LEN: usize = 10;

/// Longest thing name the registry accepts.
pub const MAX_THING_NAME_LEN: usize = 128;

const ACCEPTED: &str = "/accepted";
const REJECTED: &str = "/rejected";
const VERIFICATION_SUFFIX: &str = "/openworld";

/// Topic names for one provisioning template.
#[derive(Debug, Clone)]
pub struct Topics {
    register: String,
}

impl Topics {
    pub fn new(template: &str) -> Self {
        Self {
            register: format!("$aws/provisioning-templates/{template}/provision/json"),
        }
    }

    pub fn create_certificate(&self) -> &str {
        CREATE_CERTIFICATE_TOPIC
    }

    pub fn create_certificate_accepted(&self) -> String {
        format!("{CREATE_CERTIFICATE_TOPIC}{ACCEPTED}")
    }

    pub fn create_certificate_rejected(&self) -> String {
        format!("{CREATE_CERTIFICATE_TOPIC}{REJECTED}")
    }

    pub fn register_thing(&self) -> &str {
        &self.register
    }

    pub fn register_thing_accepted(&self) -> String {
        format!("{}{ACCEPTED}", self.register)
    }

    pub fn register_thing_rejected(&self) -> String {
        format!("{}{REJECTED}", self.register)
    }

    pub fn rejected(&self) -> [String; 2] {
        [
            self.create_certificate_rejected(),
            self.register_thing_rejected(),
        ]
    }

    pub fn accepted(&self) -> [String; 2] {
        [
            self.create_certificate_accepted(),
            self.register_thing_accepted(),
        ]
    }

    pub fn is_rejected(&self, topic: &str) -> bool {
        topic == self.create_certificate_rejected() || topic == self.register_thing_rejected()
    }

    pub fn verification(thing_name: &str) -> String {
        format!("{thing_name}{VERIFICATION_SUFFIX}")
    }
}

/// Body of the create-certificate request: an empty object.
#[derive(Debug, Default, Serialize)]
pub struct CreateCertificateRequest {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterThingRequest<'a> {
    pub certificate_ownership_token: &'a str,
    pub parameters: BTreeMap<String, Value>,
}

impl<'a> RegisterThingRequest<'a> {
    /// `SerialNumber` always carries the correlation id, even if the extra
    /// template parameters name it too.
    pub fn new(
        token: &'a str,
        serial_number: &str,
        extra: &BTreeMap<String, Value>,
    ) -> Self {
        let mut parameters = extra.clone();
        parameters.insert("SerialNumber".into(), Value::String(serial_number.into()));
        Self {
            certificate_ownership_token: token,
            parameters,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VerificationMessage<'a> {
    #[serde(rename = "ServiceResponse")]
    pub service_response: &'a str,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateCreated {
    pub certificate_id: String,
    pub certificate_pem: String,
    pub private_key: String,
    pub certificate_ownership_token: String,
}

impl CertificateCreated {
    /// First ten characters of the certificate id, used to name the files.
    pub fn file_prefix(&self) -> Result<&str, ProvisionError> {
        let prefix = self
            .certificate_id
            .get(..FILE_PREFIX_LEN)
            .ok_or_else(|| {
                ProvisionError::MalformedResponse(format!(
                    "certificateId {:?} shorter than {FILE_PREFIX_LEN} characters",
                    self.certificate_id
                ))
            })?;
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProvisionError::MalformedResponse(format!(
                "certificateId {:?} is not usable as a file name",
                self.certificate_id
            )));
        }
        Ok(prefix)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigured {
    pub thing_name: String,
    pub device_configuration: Value,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub status_code: Option<u16>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    CertificateCreated(CertificateCreated),
    DeviceConfigured(DeviceConfigured),
    Rejected(Rejection),
}

impl Response {
    pub fn decode(payload: &[u8]) -> Result<Self, ProvisionError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ProvisionError::MalformedResponse(format!("invalid JSON: {e}")))?;
        let Some(fields) = value.as_object() else {
            return Err(ProvisionError::MalformedResponse(
                "response is not a JSON object".into(),
            ));
        };
        let present = |name: &str| fields.get(name).is_some_and(|v| !v.is_null());

        if present("certificateId") {
            let created: CertificateCreated = shape(value, "certificate")?;
            return Ok(Self::CertificateCreated(created));
        }
        if present("deviceConfiguration") {
            let configured: DeviceConfigured = shape(value, "registration")?;
            if !is_valid_thing_name(&configured.thing_name) {
                return Err(ProvisionError::MalformedResponse(format!(
                    "registration response has an unusable thingName {:?}",
                    configured.thing_name
                )));
            }
            return Ok(Self::DeviceConfigured(configured));
        }
        if present("errorCode") || present("statusCode") {
            return Ok(Self::Rejected(shape(value, "rejection")?));
        }
        Err(ProvisionError::MalformedResponse(
            "response carries none of certificateId, deviceConfiguration or errorCode".into(),
        ))
    }
}

/// Thing names become the MQTT client id of the permanent connection, so
/// only the registry's own character set is accepted.
pub fn is_valid_thing_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_THING_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-'))
}

fn shape<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, ProvisionError> {
    serde_json::from_value(value)
        .map_err(|e| ProvisionError::MalformedResponse(format!("{what} response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topics_follow_template_name() {
        let topics = Topics::new("FleetTemplate");
        assert_eq!(topics.create_certificate(), "$aws/certificates/create/json");
        assert_eq!(
            topics.register_thing(),
            "$aws/provisioning-templates/FleetTemplate/provision/json"
        );
        assert_eq!(
            topics.register_thing_rejected(),
            "$aws/provisioning-templates/FleetTemplate/provision/json/rejected"
        );
        assert!(topics.is_rejected("$aws/certificates/create/json/rejected"));
        assert!(!topics.is_rejected("$aws/certificates/create/json/accepted"));
        assert_eq!(Topics::verification("thing-42"), "thing-42/openworld");
    }

    #[test]
    fn requests_keep_declared_field_names() {
        let empty = serde_json::to_string(&CreateCertificateRequest::default()).unwrap();
        assert_eq!(empty, "{}");

        let mut extra = BTreeMap::new();
        extra.insert("SerialNumber".to_string(), json!("ignored"));
        extra.insert("hasValidAccount".to_string(), json!(true));
        let register = RegisterThingRequest::new("tok1", "corr-1", &extra);
        assert_eq!(
            serde_json::to_value(&register).unwrap(),
            json!({
                "certificateOwnershipToken": "tok1",
                "parameters": {"SerialNumber": "corr-1", "hasValidAccount": true}
            })
        );

        let verify = VerificationMessage {
            service_response: "hello",
        };
        assert_eq!(
            serde_json::to_string(&verify).unwrap(),
            r#"{"ServiceResponse":"hello"}"#
        );
    }

    #[test]
    fn certificate_response_decoded() {
        let payload = br#"{"certificateId":"abcdefghij1234","certificatePem":"PEM",
            "privateKey":"KEY","certificateOwnershipToken":"tok1"}"#;
        let Response::CertificateCreated(created) = Response::decode(payload).unwrap() else {
            panic!("expected certificate response");
        };
        assert_eq!(created.certificate_ownership_token, "tok1");
        assert_eq!(created.file_prefix().unwrap(), "abcdefghij");
    }

    #[test]
    fn certificate_response_missing_key_is_malformed() {
        let payload = br#"{"certificateId":"abcdefghij1234","certificatePem":"PEM"}"#;
        let err = Response::decode(payload).unwrap_err();
        assert!(matches!(err, ProvisionError::MalformedResponse(_)));
    }

    #[test]
    fn short_or_unsafe_certificate_id_rejected_as_prefix() {
        let mut created = CertificateCreated {
            certificate_id: "abc".into(),
            certificate_pem: String::new(),
            private_key: String::new(),
            certificate_ownership_token: String::new(),
        };
        assert!(created.file_prefix().is_err());
        created.certificate_id = "../../etc/passwd".into();
        assert!(created.file_prefix().is_err());
    }

    #[test]
    fn registration_response_decoded() {
        let payload = br#"{"deviceConfiguration":{},"thingName":"thing-42"}"#;
        let Response::DeviceConfigured(configured) = Response::decode(payload).unwrap() else {
            panic!("expected registration response");
        };
        assert_eq!(configured.thing_name, "thing-42");
    }

    #[test]
    fn thing_name_outside_registry_charset_is_malformed() {
        let long = "x".repeat(MAX_THING_NAME_LEN + 1);
        for name in ["", " thing-42", "thing 42", "thing/42", long.as_str()] {
            let payload = json!({"deviceConfiguration": {}, "thingName": name}).to_string();
            assert!(
                matches!(
                    Response::decode(payload.as_bytes()),
                    Err(ProvisionError::MalformedResponse(_))
                ),
                "{name:?}"
            );
        }
        assert!(is_valid_thing_name("Fleet:device_01-a"));
    }

    #[test]
    fn null_discriminators_are_not_matches() {
        let payload = br#"{"certificateId":null,"deviceConfiguration":null}"#;
        assert!(matches!(
            Response::decode(payload),
            Err(ProvisionError::MalformedResponse(_))
        ));
    }

    #[test]
    fn rejection_shape_decoded() {
        let payload =
            br#"{"statusCode":400,"errorCode":"InvalidParameters","errorMessage":"bad"}"#;
        assert_eq!(
            Response::decode(payload).unwrap(),
            Response::Rejected(Rejection {
                status_code: Some(400),
                error_code: Some("InvalidParameters".into()),
                error_message: Some("bad".into()),
            })
        );
    }

    #[test]
    fn non_object_payload_is_malformed() {
        assert!(Response::decode(b"[1,2]").is_err());
        assert!(Response::decode(b"not json").is_err());
    }
}

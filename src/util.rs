use base64::prelude::*;

pub fn uuid_as_b64(uuid: &uuid::Uuid) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(uuid.as_bytes())
}

pub fn b64_to_uuid(b64: &str) -> Option<uuid::Uuid> {
    let uuid_bytes = match BASE64_URL_SAFE_NO_PAD.decode(b64) {
        Ok(n) => n,
        Err(_) => {
            return None;
        }
    };
    let uuid_obj = match uuid::Uuid::from_slice(&uuid_bytes) {
        Ok(u) => u,
        Err(_) => {
            return None
        }
    };
    Some(uuid_obj)
}

pub fn error_list_to_result<D: Into<Option<String>>>(
    mut errors: Vec<crate::types::error::Error>, compound_detail: D
) -> Result<(), crate::types::error::Error> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.pop().unwrap()),
        _ => Err(crate::types::error::Error {
            error_type: crate::types::error::Type::Compound,
            status: 400,
            title: "Compound errors".to_string(),
            detail: match compound_detail.into() {
                Some(d) => d,
                None => "Multiple errors make this request invalid".to_string(),
            },
            sub_problems: errors,
            instance: None,
            identifier: None,
        })
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn uuid_b64_round_trip() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(super::b64_to_uuid(&super::uuid_as_b64(&id)), Some(id));
    }

    #[test]
    fn invalid_b64_ids() {
        assert_eq!(super::b64_to_uuid("not!base64"), None);
        assert_eq!(super::b64_to_uuid("AAAA"), None);
    }
}

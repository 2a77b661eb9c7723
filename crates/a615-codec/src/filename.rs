use serde::{Deserialize, Serialize};

use crate::error::{ArincError, Result};

/// ARINC 615A record carried by a TFTP file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordKind {
    Lui,
    Lur,
    Lus,
}

impl RecordKind {
    pub fn extension(self) -> &'static str {
        match self {
            RecordKind::Lui => "LUI",
            RecordKind::Lur => "LUR",
            RecordKind::Lus => "LUS",
        }
    }

    /// File name for this record addressed to `part_number`.
    pub fn file_name(self, part_number: &str) -> String {
        format!("{}.{}", part_number, self.extension())
    }
}

/// Checks that `filename` names this device and returns the record it holds.
///
/// The device part number may appear anywhere in the name; the extension is
/// matched case-insensitively. Unknown extensions are rejected.
pub fn classify_filename(filename: &str, device_part_number: &str) -> Result<RecordKind> {
    if device_part_number.is_empty() || !filename.contains(device_part_number) {
        return Err(ArincError::UnauthorizedDevice(filename.to_string()));
    }

    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or_default();

    [RecordKind::Lui, RecordKind::Lur, RecordKind::Lus]
        .into_iter()
        .find(|kind| extension.eq_ignore_ascii_case(kind.extension()))
        .ok_or_else(|| ArincError::UnsupportedFileType(filename.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PN: &str = "EMB-HW-002-021-003";

    #[test]
    fn recognises_record_extensions() {
        assert_eq!(classify_filename("EMB-HW-002-021-003.LUR", PN), Ok(RecordKind::Lur));
        assert_eq!(classify_filename("EMB-HW-002-021-003.LUI", PN), Ok(RecordKind::Lui));
        assert_eq!(classify_filename("EMB-HW-002-021-003.lus", PN), Ok(RecordKind::Lus));
    }

    #[test]
    fn rejects_other_devices() {
        assert_eq!(
            classify_filename("OTHER-PN.LUI", PN),
            Err(ArincError::UnauthorizedDevice("OTHER-PN.LUI".to_string()))
        );
        assert!(classify_filename("anything.LUI", "").is_err());
    }

    #[test]
    fn rejects_unknown_extensions() {
        for name in ["EMB-HW-002-021-003", "EMB-HW-002-021-003.BIN", "EMB-HW-002-021-003.LURX"] {
            assert!(matches!(
                classify_filename(name, PN),
                Err(ArincError::UnsupportedFileType(_))
            ));
        }
    }

    #[test]
    fn builds_file_names() {
        assert_eq!(RecordKind::Lus.file_name(PN), "EMB-HW-002-021-003.LUS");
    }
}

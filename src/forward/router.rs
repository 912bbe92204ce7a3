use crate::dicom::{uids, DicomObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Archive,
    Worker,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Archive => "archive",
            Route::Worker => "worker",
        }
    }
}

/// Content-based routing for gateway mode, decided on the header alone:
/// result objects and non-image object classes go to the archive, everything
/// else goes to a worker.
pub fn determine_route(header: &DicomObject) -> Route {
    let series_description = header.series_description().unwrap_or_default();
    let modality = header.modality().unwrap_or_default();
    let sop_class = header.sop_class_uid().unwrap_or_default();

    if series_description.trim() == "AI_RESULT"
        || matches!(modality.trim(), "SR" | "OT")
        || sop_class.trim() == uids::SECONDARY_CAPTURE_IMAGE_STORAGE
    {
        return Route::Archive;
    }
    Route::Worker
}

//! `multipart/form-data` uploads.
//!
//! A form carries exactly one file part followed by any number of text
//! fields. [`MultipartForm`] only holds and validates the parts; the wire
//! encoding is reqwest's, rebuilt for every attempt so retries resend the
//! same content.

use bytes::Bytes;
use reqwest::multipart::{Form, Part};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::http::{OCTET_STREAM, Request, Response};

/// A file upload with optional text fields.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartForm {
    field_name: String,
    filename: String,
    content: Bytes,
    fields: Vec<(String, String)>,
}

impl MultipartForm {
    pub fn new(
        field_name: impl Into<String>,
        filename: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            filename: filename.into(),
            content: content.into(),
            fields: Vec::new(),
        }
    }

    /// Content type sent for the file part.
    pub fn file_content_type(&self) -> &'static str {
        OCTET_STREAM
    }

    /// Add a text field. A later value for the same name replaces the
    /// earlier one but keeps its position.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Reject names that would break out of a `Content-Disposition` header.
    pub(crate) fn validate(&self) -> Result<()> {
        disposition_value("field name", &self.field_name)?;
        disposition_value("filename", &self.filename)?;
        for (name, _) in &self.fields {
            disposition_value("field name", name)?;
        }
        Ok(())
    }

    /// Build a fresh reqwest form with a new boundary.
    pub(crate) fn to_form(&self) -> Result<Form> {
        let file = Part::stream_with_length(self.content.clone(), self.content.len() as u64)
            .file_name(disposition_value("filename", &self.filename)?)
            .mime_str(self.file_content_type())
            .map_err(|e| Error::Encoding(format!("invalid file content type: {e}")))?;

        let mut form = Form::new()
            .percent_encode_noop()
            .part(disposition_value("field name", &self.field_name)?, file);
        for (name, value) in &self.fields {
            form = form.text(disposition_value("field name", name)?, value.clone());
        }
        Ok(form)
    }
}

/// Escape a value for a quoted `Content-Disposition` parameter.
fn disposition_value(what: &str, value: &str) -> Result<String> {
    if value.contains(['\r', '\n']) {
        return Err(Error::Encoding(format!("{what} must not contain line breaks")));
    }
    Ok(value.replace('"', "%22"))
}

impl Client {
    /// Upload a file with optional text fields as `multipart/form-data`.
    pub async fn upload<K, V>(
        &self,
        path: &str,
        field_name: &str,
        filename: &str,
        content: impl Into<Bytes>,
        extra_fields: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Response>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let form = extra_fields
            .into_iter()
            .fold(MultipartForm::new(field_name, filename, content), |form, (k, v)| {
                form.text(k, v)
            });
        self.upload_form(path, &form).await
    }

    /// POST an already-built form.
    pub async fn upload_form(&self, path: &str, form: &MultipartForm) -> Result<Response> {
        tracing::debug!(
            path,
            filename = %form.filename,
            bytes = form.content.len(),
            "Uploading file"
        );
        self.execute(Request::post(path).multipart(form.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_replaces_duplicate_names() {
        let form = MultipartForm::new("file", "a.bin", Bytes::new())
            .text("mode", "fast")
            .text("lang", "en")
            .text("mode", "slow");

        assert_eq!(
            form.fields(),
            &[
                ("mode".to_string(), "slow".to_string()),
                ("lang".to_string(), "en".to_string()),
            ]
        );
    }

    #[test]
    fn test_each_form_gets_its_own_boundary() {
        let form = MultipartForm::new("file", "a.bin", vec![0u8, 1, 2]).text("k", "v");
        let first = form.to_form().unwrap();
        let second = form.to_form().unwrap();

        assert!(!first.boundary().is_empty());
        assert_ne!(first.boundary(), second.boundary());
    }

    #[test]
    fn test_quotes_are_escaped() {
        assert_eq!(
            disposition_value("filename", "say \"hi\".txt").unwrap(),
            "say %22hi%22.txt"
        );
    }

    #[test]
    fn test_line_breaks_in_names_are_rejected() {
        let form = MultipartForm::new("file", "evil\r\nX-Injected: 1", "x");
        assert!(matches!(form.validate(), Err(Error::Encoding(_))));
        assert!(matches!(form.to_form(), Err(Error::Encoding(_))));

        let form = MultipartForm::new("file", "ok.txt", "x").text("bad\nname", "v");
        assert!(matches!(form.validate(), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_text_values_may_span_lines() {
        let form = MultipartForm::new("file", "ok.txt", "x").text("prompt", "line one\nline two");
        assert!(form.validate().is_ok());
        assert!(form.to_form().is_ok());
    }
}

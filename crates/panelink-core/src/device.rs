//! Panel commands
//!
//! Typed wrappers for the interactive requests the panel firmware
//! understands. Each one blocks until the user answers on the panel, so none
//! of them has a timeout.

use std::ops::Deref;

use serde::Serialize;
use serde_json::Value;

use crate::protocol::{Connection, ConnectionConfig, ProtocolError, Result};

/// Message box with one or two buttons
#[derive(Debug, Clone, Serialize)]
pub struct Dialog {
    pub text: String,
    pub title: String,
    pub text_yes: String,
    pub text_no: String,
}

impl Default for Dialog {
    fn default() -> Self {
        Self {
            text: String::new(),
            title: String::new(),
            text_yes: "OK".to_string(),
            text_no: "OK".to_string(),
        }
    }
}

/// Option list with an explanatory text above it
#[derive(Debug, Clone, Serialize)]
pub struct SelectMenu {
    pub text: String,
    pub title: String,
    pub options: Vec<String>,
    pub text_yes: String,
    pub text_no: String,
}

impl Default for SelectMenu {
    fn default() -> Self {
        Self {
            text: String::new(),
            title: String::new(),
            options: vec!["Empty".to_string()],
            text_yes: "OK".to_string(),
            text_no: "CANCEL".to_string(),
        }
    }
}

/// Full-screen option list
#[derive(Debug, Clone, Serialize)]
pub struct SelectList {
    pub title: String,
    pub options: Vec<String>,
    pub text_yes: String,
    pub text_no: String,
}

impl Default for SelectList {
    fn default() -> Self {
        Self {
            title: String::new(),
            options: vec!["Empty".to_string()],
            text_yes: "OK".to_string(),
            text_no: "CANCEL".to_string(),
        }
    }
}

/// On-panel text editor
#[derive(Debug, Clone, Serialize)]
pub struct InputText {
    pub text: String,
    pub title: String,
}

impl Default for InputText {
    fn default() -> Self {
        Self {
            text: String::new(),
            title: "Edit Text".to_string(),
        }
    }
}

/// A [`Connection`] plus the panel's interactive commands
pub struct Panel {
    connection: Connection,
}

impl Panel {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::from_connection(Connection::new(config))
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    /// Show a message box. Returns the panel's raw `value` (which button).
    pub async fn dialog(&self, dialog: &Dialog) -> Result<Value> {
        self.command("dialog", dialog).await
    }

    /// Show a menu. Returns the selected index; negative values mean the
    /// user left with the "no" button.
    pub async fn select_menu(&self, menu: &SelectMenu) -> Result<i64> {
        check_options(&menu.options)?;
        let value = self.command("select_menu", menu).await?;
        as_index(value)
    }

    /// Show a list. Same return convention as [`Panel::select_menu`].
    pub async fn select_list(&self, list: &SelectList) -> Result<i64> {
        check_options(&list.options)?;
        let value = self.command("select_list", list).await?;
        as_index(value)
    }

    /// Let the user edit `text`; returns the edited string
    pub async fn input_text(&self, input: &InputText) -> Result<String> {
        match self.command("input_text", input).await? {
            Value::String(s) => Ok(s),
            other => Err(ProtocolError::InvalidResponse(format!(
                "input_text value is not a string: {other}"
            ))),
        }
    }

    async fn command<T: Serialize>(&self, event: &str, request: &T) -> Result<Value> {
        let Value::Object(payload) = serde_json::to_value(request)? else {
            return Err(ProtocolError::InvalidArgument(format!(
                "{event} request must serialize to an object"
            )));
        };
        let reply = self.connection.request_with_result(event, payload, None).await?;
        reply
            .into_payload()
            .remove("value")
            .ok_or_else(|| ProtocolError::InvalidResponse(format!("{event} reply has no value")))
    }
}

impl Deref for Panel {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

fn check_options(options: &[String]) -> Result<()> {
    if options.is_empty() {
        return Err(ProtocolError::InvalidArgument(
            "options must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn as_index(value: Value) -> Result<i64> {
    value.as_i64().ok_or_else(|| {
        ProtocolError::InvalidResponse(format!("selection is not an integer: {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let menu = serde_json::to_value(SelectMenu::default()).unwrap();
        assert_eq!(
            menu,
            json!({
                "text": "",
                "title": "",
                "options": ["Empty"],
                "text_yes": "OK",
                "text_no": "CANCEL",
            })
        );
        assert_eq!(InputText::default().title, "Edit Text");
        assert_eq!(Dialog::default().text_no, "OK");
    }

    #[tokio::test]
    async fn test_empty_options_rejected_before_sending() {
        let panel = Panel::new(ConnectionConfig::default());
        let list = SelectList {
            options: Vec::new(),
            ..Default::default()
        };
        let err = panel.select_list(&list).await.unwrap_err();
        // Not NotConnected: validation happens first
        assert!(matches!(err, ProtocolError::InvalidArgument(_)));
    }

    #[test]
    fn test_as_index() {
        assert_eq!(as_index(json!(-2)).unwrap(), -2);
        assert!(as_index(json!("1")).is_err());
    }
}

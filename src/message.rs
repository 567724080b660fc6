/*!
The [`Message`] type.

A message is either text that's already been rendered, or a value whose rendering is deferred until it's needed. Pipelines that format eagerly render deferred messages on the producing thread before they're enqueued. Otherwise, the background consumer renders them just before dispatch.
*/

use std::{
    any::Any,
    borrow::Cow,
    fmt,
    panic::{self, AssertUnwindSafe},
};

/**
The message of a log event.
*/
pub enum Message {
    /**
    A message that's already been rendered to text.
    */
    Text(Cow<'static, str>),
    /**
    A message that will be rendered later.
    */
    Deferred(Box<dyn fmt::Display + Send>),
}

impl Message {
    /**
    Create a message from text.
    */
    pub fn text(text: impl Into<Cow<'static, str>>) -> Self {
        Message::Text(text.into())
    }

    /**
    Create a message that's rendered from `value` later.
    */
    pub fn deferred(value: impl fmt::Display + Send + 'static) -> Self {
        Message::Deferred(Box::new(value))
    }

    /**
    Get the rendered text of the message, if it's been rendered.
    */
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(&**text),
            Message::Deferred(_) => None,
        }
    }

    /**
    Whether the message has been rendered to text.
    */
    pub fn is_rendered(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /**
    Render a deferred message to text.

    If rendering fails, the message is left unchanged and the error is returned.
    */
    pub fn render(&mut self) -> Result<(), RenderError> {
        if let Message::Deferred(value) = &*self {
            let text = try_render(&**value)?;

            *self = Message::Text(Cow::Owned(text));
        }

        Ok(())
    }

    /**
    Render a deferred message to text, replacing it with a fallback if rendering fails.

    The error is returned so it can be reported.
    */
    pub(crate) fn render_or_fallback(&mut self) -> Option<RenderError> {
        match self.render() {
            Ok(()) => None,
            Err(err) => {
                *self = Message::Text(Cow::Owned(format!("<message unavailable: {err}>")));

                Some(err)
            }
        }
    }
}

impl From<&'static str> for Message {
    fn from(text: &'static str) -> Self {
        Message::Text(Cow::Borrowed(text))
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(Cow::Owned(text))
    }
}

impl From<Cow<'static, str>> for Message {
    fn from(text: Cow<'static, str>) -> Self {
        Message::Text(text)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text(text) => fmt::Debug::fmt(text, f),
            Message::Deferred(_) => f.write_str("<deferred>"),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text(text) => f.write_str(text),
            Message::Deferred(value) => fmt::Display::fmt(value, f),
        }
    }
}

/**
An error rendering a [`Message`].
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderError {
    reason: String,
}

impl RenderError {
    /**
    A description of what went wrong.
    */
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to render message: {}", self.reason)
    }
}

impl std::error::Error for RenderError {}

fn try_render(value: &(dyn fmt::Display + Send)) -> Result<String, RenderError> {
    let mut buf = String::new();

    // `format!` would panic on a `fmt::Error`, so write directly
    match panic::catch_unwind(AssertUnwindSafe(|| {
        fmt::write(&mut buf, format_args!("{}", value))
    })) {
        Ok(Ok(())) => Ok(buf),
        Ok(Err(fmt::Error)) => Err(RenderError {
            reason: "the value returned a formatting error".to_owned(),
        }),
        Err(payload) => Err(RenderError {
            reason: format!("the value panicked: {}", panic_message(&*payload)),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<unknown>"
    }
}

use owo_colors::{OwoColorize, Style};

use crate::gatt::{AttributeHandle, Status};

/// Colours terminal output; a no-op when stdout is not a terminal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().cyan())
    }

    pub(crate) fn success(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().green())
    }

    pub(crate) fn warning(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold().yellow())
    }

    pub(crate) fn muted(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().dimmed())
    }

    pub(crate) fn value(&self, text: impl AsRef<str>) -> String {
        self.paint(text.as_ref(), Style::new().bold())
    }

    pub(crate) fn handle(&self, handle: AttributeHandle) -> String {
        self.paint(&handle.to_string(), Style::new().magenta())
    }

    /// Green for success, yellow for anything the peer refused.
    pub(crate) fn status(&self, status: Status) -> String {
        if status.is_success() {
            self.success(status.to_string())
        } else {
            self.warning(status.to_string())
        }
    }

    fn paint(&self, text: &str, style: Style) -> String {
        if self.use_colour {
            text.style(style).to_string()
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::success(Status::Success, "success")]
    #[case::refused(Status::WriteNotPermitted, "write_not_permitted")]
    fn plain_painter_leaves_text_untouched(#[case] status: Status, #[case] expected: &str) {
        let painter = Painter::new(false);
        assert_eq!(expected, painter.status(status));
        assert_eq!("0x002a", painter.handle(AttributeHandle::new(0x2A)));
    }

    #[test]
    fn coloured_painter_wraps_text_in_escapes() {
        let painter = Painter::new(true);
        let styled = painter.heading("Services");
        assert_ne!("Services", styled);
        assert!(styled.contains("Services"));
    }
}

mod attribute_view;
mod inspect_view;
mod listen_view;
mod painter;
mod spinner;
mod table;

pub(crate) use self::attribute_view::{ReadView, WriteView};
pub(crate) use self::inspect_view::InspectView;
pub(crate) use self::listen_view::{ListenNotificationView, ListenReadyView, ListenSummaryView};
pub(crate) use self::painter::Painter;
pub(crate) use self::spinner::Spinner;

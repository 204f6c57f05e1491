mod device_view;
mod painter;
mod response_view;
mod table;

pub(crate) use self::device_view::DeviceView;
pub(crate) use self::painter::Painter;
pub(crate) use self::response_view::{AppVersionView, ResponseView};

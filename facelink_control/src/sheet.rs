//! Named collections of controls.
//!
//! A stage declares its controls once with [`control_sheet!`]; the worker
//! builds the sheet as [`Side::Host`](crate::controls::Side::Host) and the
//! supervisor builds the same sheet as the client mirror.

use crate::controls::{ControlEndpoint, ControlMessage, Side};

/// A fixed set of controls shared by a worker and its supervisor.
pub trait ControlSheet: Send + 'static {
    /// Build every control as the given side
    fn new(side: Side) -> Self
    where
        Self: Sized;

    /// Every control, in declaration order
    fn endpoints_mut(&mut self) -> Vec<&mut dyn ControlEndpoint>;

    /// Route a message to the control it names.
    ///
    /// Returns false when no control has that name or the control ignored it.
    fn dispatch(&mut self, message: ControlMessage) -> bool {
        let ControlMessage { control, body } = message;
        match self.endpoints_mut().into_iter().find(|e| e.name() == control) {
            Some(endpoint) => endpoint.handle(body),
            None => {
                tracing::warn!(control = %control, "Message for unknown control");
                false
            }
        }
    }

    /// Collect everything the controls have queued for the other side
    fn drain(&mut self) -> Vec<ControlMessage> {
        let mut messages = Vec::new();
        for endpoint in self.endpoints_mut() {
            let control = endpoint.name().to_string();
            messages.extend(endpoint.take_outgoing().into_iter().map(|body| ControlMessage {
                control: control.clone(),
                body,
            }));
        }
        messages
    }

    /// Return every control to its boot default
    fn reset_all(&mut self) {
        for endpoint in self.endpoints_mut() {
            endpoint.reset();
        }
    }
}

/// Declare a struct of controls implementing [`ControlSheet`].
///
/// Each field is built with `<Type>::new("<field name>", side)`.
///
/// ```rust
/// use facelink_control::control_sheet;
/// use facelink_control::controls::{Flag, Number};
///
/// control_sheet! {
///     /// Controls of a player
///     pub struct PlayerControls {
///         is_paused: Flag,
///         fps: Number,
///     }
/// }
/// ```
#[macro_export]
macro_rules! control_sheet {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident : $fty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $fty,
            )*
        }

        impl $crate::sheet::ControlSheet for $name {
            #[allow(unused_variables)]
            fn new(side: $crate::controls::Side) -> Self {
                Self {
                    $( $field: <$fty>::new(stringify!($field), side), )*
                }
            }

            fn endpoints_mut(&mut self) -> Vec<&mut dyn $crate::controls::ControlEndpoint> {
                vec![$( &mut self.$field as &mut dyn $crate::controls::ControlEndpoint ),*]
            }
        }
    };
}

control_sheet! {
    /// A sheet without controls, for stages nobody configures
    pub struct EmptySheet {}
}

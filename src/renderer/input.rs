//! Window input events and their translation from window messages.

use imgui::{Io, MouseButton};

/// An input event the overlay may consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    MouseButton { button: MouseButton, down: bool },
    MouseMove { x: f32, y: f32 },
    MouseWheel { delta: f32 },
    MouseWheelH { delta: f32 },
    /// Virtual key code, with left/right modifiers already resolved.
    Key { vk: u8, down: bool },
    Char(char),
}

/// Mouse and keyboard capture are tracked separately by the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputClass {
    Mouse,
    Keyboard,
}

impl InputEvent {
    pub fn class(&self) -> InputClass {
        match self {
            InputEvent::MouseButton { .. }
            | InputEvent::MouseMove { .. }
            | InputEvent::MouseWheel { .. }
            | InputEvent::MouseWheelH { .. } => InputClass::Mouse,
            InputEvent::Key { .. } | InputEvent::Char(_) => InputClass::Keyboard,
        }
    }
}

// Virtual key codes of the modifiers, from WinUser.h.
const VK_SHIFT: u8 = 0x10;
const VK_CONTROL: u8 = 0x11;
const VK_MENU: u8 = 0x12;
const VK_LWIN: u8 = 0x5b;
const VK_RWIN: u8 = 0x5c;
const VK_LSHIFT: u8 = 0xa0;
const VK_RSHIFT: u8 = 0xa1;
const VK_LCONTROL: u8 = 0xa2;
const VK_RCONTROL: u8 = 0xa3;
const VK_LMENU: u8 = 0xa4;
const VK_RMENU: u8 = 0xa5;

/// Feed an event into dear imgui's input state.
pub fn apply_to_io(io: &mut Io, event: &InputEvent) {
    match *event {
        InputEvent::MouseButton { button, down } => io.mouse_down[button as usize] = down,
        InputEvent::MouseMove { x, y } => io.mouse_pos = [x, y],
        InputEvent::MouseWheel { delta } => io.mouse_wheel += delta,
        InputEvent::MouseWheelH { delta } => io.mouse_wheel_h += delta,
        InputEvent::Key { vk, down } => {
            io.keys_down[vk as usize] = down;

            match vk {
                VK_CONTROL | VK_LCONTROL | VK_RCONTROL => io.key_ctrl = down,
                VK_SHIFT | VK_LSHIFT | VK_RSHIFT => io.key_shift = down,
                VK_MENU | VK_LMENU | VK_RMENU => io.key_alt = down,
                VK_LWIN | VK_RWIN => io.key_super = down,
                _ => {},
            }
        },
        InputEvent::Char(c) => io.add_input_character(c),
    }
}

#[cfg(windows)]
pub use self::win32::decode_message;

#[cfg(windows)]
mod win32 {
    use imgui::MouseButton;
    use windows::Win32::Foundation::{LPARAM, WPARAM};
    use windows::Win32::UI::Input::KeyboardAndMouse::*;
    use windows::Win32::UI::WindowsAndMessaging::*;

    use super::InputEvent;

    // Replication of the Win32 HIWORD macro.
    #[inline]
    fn hiword(l: u32) -> u16 {
        ((l >> 16) & 0xffff) as u16
    }

    // Replication of GET_X_LPARAM / GET_Y_LPARAM.
    #[inline]
    fn point_from_lparam(lparam: isize) -> (f32, f32) {
        let x = (lparam & 0xffff) as u16 as i16;
        let y = ((lparam >> 16) & 0xffff) as u16 as i16;
        (x as f32, y as f32)
    }

    fn map_vkey(wparam: u16, lparam: usize) -> VIRTUAL_KEY {
        match VIRTUAL_KEY(wparam) {
            VK_SHIFT => unsafe {
                match MapVirtualKeyW(((lparam & 0x00ff0000) >> 16) as u32, MAPVK_VSC_TO_VK_EX) {
                    0 => VIRTUAL_KEY(wparam),
                    i => VIRTUAL_KEY(i as _),
                }
            },
            VK_CONTROL => {
                if lparam & 0x01000000 != 0 {
                    VK_RCONTROL
                } else {
                    VK_LCONTROL
                }
            },
            VK_MENU => {
                if lparam & 0x01000000 != 0 {
                    VK_RMENU
                } else {
                    VK_LMENU
                }
            },
            _ => VIRTUAL_KEY(wparam),
        }
    }

    fn xbutton(wparam: usize) -> MouseButton {
        if hiword(wparam as _) == XBUTTON1 {
            MouseButton::Extra1
        } else {
            MouseButton::Extra2
        }
    }

    fn wheel_delta(wparam: usize) -> f32 {
        // This `hiword` call is equivalent to GET_WHEEL_DELTA_WPARAM
        hiword(wparam as _) as i16 as f32 / WHEEL_DELTA as f32
    }

    /// Translate a window message into an [`InputEvent`], or `None` for
    /// messages the overlay does not care about.
    pub fn decode_message(
        umsg: u32,
        WPARAM(wparam): WPARAM,
        LPARAM(lparam): LPARAM,
    ) -> Option<InputEvent> {
        let button = |button, down| Some(InputEvent::MouseButton { button, down });

        match umsg {
            state @ (WM_KEYDOWN | WM_SYSKEYDOWN | WM_KEYUP | WM_SYSKEYUP) if wparam < 256 => {
                let down = state == WM_KEYDOWN || state == WM_SYSKEYDOWN;
                let vk = map_vkey(wparam as _, lparam as _);
                Some(InputEvent::Key { vk: vk.0 as u8, down })
            },
            WM_LBUTTONDOWN | WM_LBUTTONDBLCLK => button(MouseButton::Left, true),
            WM_RBUTTONDOWN | WM_RBUTTONDBLCLK => button(MouseButton::Right, true),
            WM_MBUTTONDOWN | WM_MBUTTONDBLCLK => button(MouseButton::Middle, true),
            WM_XBUTTONDOWN | WM_XBUTTONDBLCLK => button(xbutton(wparam), true),
            WM_LBUTTONUP => button(MouseButton::Left, false),
            WM_RBUTTONUP => button(MouseButton::Right, false),
            WM_MBUTTONUP => button(MouseButton::Middle, false),
            WM_XBUTTONUP => button(xbutton(wparam), false),
            WM_MOUSEMOVE => {
                let (x, y) = point_from_lparam(lparam);
                Some(InputEvent::MouseMove { x, y })
            },
            WM_MOUSEWHEEL => Some(InputEvent::MouseWheel { delta: wheel_delta(wparam) }),
            WM_MOUSEHWHEEL => Some(InputEvent::MouseWheelH { delta: wheel_delta(wparam) }),
            WM_CHAR => char::from_u32(wparam as u32).map(InputEvent::Char),
            _ => None,
        }
    }

}

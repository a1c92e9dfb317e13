//! Interned atoms for the tracked property set.

x11rb::atom_manager! {
    /// All atoms the compositor reads or watches. Interned once at
    /// startup with a single round trip.
    pub Atoms:
    AtomsCookie {
        WM_NAME,
        WM_CLASS,
        WM_WINDOW_ROLE,
        WM_TRANSIENT_FOR,
        WM_CLIENT_LEADER,
        WM_STATE,
        UTF8_STRING,
        _NET_WM_NAME,
        _NET_WM_WINDOW_OPACITY,
        _NET_ACTIVE_WINDOW,
        _NET_WM_WINDOW_TYPE,
        _NET_WM_WINDOW_TYPE_DESKTOP,
        _NET_WM_WINDOW_TYPE_DOCK,
        _NET_WM_WINDOW_TYPE_TOOLBAR,
        _NET_WM_WINDOW_TYPE_MENU,
        _NET_WM_WINDOW_TYPE_UTILITY,
        _NET_WM_WINDOW_TYPE_SPLASH,
        _NET_WM_WINDOW_TYPE_DIALOG,
        _NET_WM_WINDOW_TYPE_DROPDOWN_MENU,
        _NET_WM_WINDOW_TYPE_POPUP_MENU,
        _NET_WM_WINDOW_TYPE_TOOLTIP,
        _NET_WM_WINDOW_TYPE_NOTIFICATION,
        _NET_WM_WINDOW_TYPE_COMBO,
        _NET_WM_WINDOW_TYPE_DND,
        _NET_WM_WINDOW_TYPE_NORMAL,
        // Per-window shadow hint: 0 forces the shadow off, anything
        // else forces it on.
        _PENUMBRA_SHADOW,
        _XROOTPMAP_ID,
        _XSETROOT_ID,
    }
}

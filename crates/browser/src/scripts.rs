//! Page-side scripts. Each one is a JS function expression invoked through
//! [`PageDriver::evaluate`](crate::driver::PageDriver::evaluate) with JSON
//! arguments, so selectors never get spliced into source text.

/// `(selector) -> bool`: the element exists and is rendered.
pub const IS_VISIBLE: &str = r#"(selector) => {
  const el = document.querySelector(selector);
  if (!el) return false;
  const style = window.getComputedStyle(el);
  if (style.visibility === 'hidden' || style.display === 'none') return false;
  const rect = el.getBoundingClientRect();
  return rect.width > 0 || rect.height > 0;
}"#;

/// `(selector) -> {x, y} | null`: scroll the element into view and return
/// its center in viewport coordinates.
pub const ELEMENT_CENTER: &str = r#"(selector) => {
  const el = document.querySelector(selector);
  if (!el) return null;
  el.scrollIntoView({ block: 'center' });
  const rect = el.getBoundingClientRect();
  if (rect.width === 0 && rect.height === 0) return { x: 0, y: 0, empty: true };
  return { x: rect.left + rect.width / 2, y: rect.top + rect.height / 2, empty: false };
}"#;

/// `(selector) -> bool`: DOM-level click, used when the element has no box.
pub const DOM_CLICK: &str = r#"(selector) => {
  const el = document.querySelector(selector);
  if (!el) return false;
  el.click();
  return true;
}"#;

/// `(selector) -> bool`: scroll into view and focus.
pub const FOCUS: &str = r#"(selector) => {
  const el = document.querySelector(selector);
  if (!el) return false;
  el.scrollIntoView({ block: 'center' });
  el.focus();
  return true;
}"#;

/// `(selector, value) -> bool`: write through the native value setter and
/// fire `input`, so the page's reactive framework sees the change. Falls
/// back to `textContent` for contenteditable editors.
pub const SET_INPUT_VALUE: &str = r#"(selector, value) => {
  const el = document.querySelector(selector);
  if (!el) return false;
  const setValue = (node, v) => {
    const proto = node.tagName === 'TEXTAREA'
      ? window.HTMLTextAreaElement.prototype
      : window.HTMLInputElement && window.HTMLInputElement.prototype;
    const desc = proto && Object.getOwnPropertyDescriptor(proto, 'value');
    if (desc && desc.set) desc.set.call(node, v);
    else node.value = v;
  };
  el.focus();
  if (el instanceof HTMLTextAreaElement || el instanceof HTMLInputElement) {
    setValue(el, '');
    el.dispatchEvent(new Event('input', { bubbles: true }));
    setValue(el, value);
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.setSelectionRange(el.value.length, el.value.length);
  } else {
    el.textContent = '';
    el.dispatchEvent(new InputEvent('input', { bubbles: true }));
    el.textContent = value;
    el.dispatchEvent(new InputEvent('input', { bubbles: true, data: value }));
  }
  return true;
}"#;

/// `(rootSelector, chromeSelectors, binding) -> bool`: observe the document
/// and push `{count, text}` of the last `rootSelector` match, chrome
/// excluded, to `window[binding]` whenever it changes.
///
/// Chrome is hidden through inline style only for the duration of the read;
/// the observer does not watch attributes, so this does not re-trigger it.
pub const INSTALL_MUTATION_BRIDGE: &str = r#"(rootSelector, chromeSelectors, binding) => {
  const registry = (window.__chatrelayBridges = window.__chatrelayBridges || {});
  if (registry[binding]) registry[binding].disconnect();
  let last = null;
  const push = () => {
    const nodes = document.querySelectorAll(rootSelector);
    const node = nodes[nodes.length - 1];
    let text = '';
    if (node) {
      const chrome = chromeSelectors.length
        ? Array.from(node.querySelectorAll(chromeSelectors.join(', ')))
        : [];
      const saved = chrome.map((el) => el.getAttribute('style'));
      chrome.forEach((el) => { el.style.display = 'none'; });
      text = node.innerText.trim();
      chrome.forEach((el, i) => {
        if (saved[i] === null) el.removeAttribute('style');
        else el.setAttribute('style', saved[i]);
      });
    }
    const payload = JSON.stringify({ count: nodes.length, text });
    if (payload === last) return;
    last = payload;
    if (typeof window[binding] === 'function') window[binding](payload);
  };
  const observer = new MutationObserver(push);
  observer.observe(document.body, { childList: true, subtree: true, characterData: true });
  registry[binding] = observer;
  push();
  return true;
}"#;

/// `(binding) -> bool`
pub const REMOVE_MUTATION_BRIDGE: &str = r#"(binding) => {
  const registry = window.__chatrelayBridges || {};
  const observer = registry[binding];
  if (!observer) return false;
  observer.disconnect();
  delete registry[binding];
  return true;
}"#;

/// Installed on every new document: hide the automation flag.
pub const HIDE_WEBDRIVER: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => false });";

/// `(busySelector, readySelector) -> "busy" | "idle" | "unknown"`
pub const BUSY_STATE: &str = r#"(busySelector, readySelector) => {
  if (document.querySelector(busySelector)) return 'busy';
  const btn = document.querySelector(readySelector);
  if (!btn) return 'unknown';
  const style = window.getComputedStyle(btn);
  const visible = style.visibility !== 'hidden' && style.display !== 'none';
  return !btn.disabled && visible ? 'idle' : 'busy';
}"#;

/// `(answerSelector, chromeSelectors) -> {count, text}` for the last answer
/// region, chrome excluded. The page is left as it was.
pub const ANSWER_SNAPSHOT: &str = r#"(answerSelector, chromeSelectors) => {
  const nodes = document.querySelectorAll(answerSelector);
  const node = nodes[nodes.length - 1];
  if (!node) return { count: nodes.length, text: '' };
  const chrome = chromeSelectors.length
    ? Array.from(node.querySelectorAll(chromeSelectors.join(', ')))
    : [];
  const saved = chrome.map((el) => el.getAttribute('style'));
  chrome.forEach((el) => { el.style.display = 'none'; });
  const text = node.innerText.trim();
  chrome.forEach((el, i) => {
    if (saved[i] === null) el.removeAttribute('style');
    else el.setAttribute('style', saved[i]);
  });
  return { count: nodes.length, text };
}"#;

/// `(answerSelector, chromeSelectors, codeSelector) -> {count, text}`:
/// clean the last answer region and read it as plain text, with scrollable
/// code regions re-wrapped as fenced blocks.
pub const EXTRACT_REPLY: &str = r#"(answerSelector, chromeSelectors, codeSelector) => {
  const nodes = document.querySelectorAll(answerSelector);
  const node = nodes[nodes.length - 1];
  if (!node) return { count: 0, text: '' };
  if (chromeSelectors.length) {
    node.querySelectorAll(chromeSelectors.join(', ')).forEach((el) => el.remove());
  }
  node.querySelectorAll(codeSelector).forEach((el) => {
    const body = el.innerText.trim();
    if (!body.startsWith('```')) el.innerText = '```\n' + body + '\n```';
  });
  return { count: nodes.length, text: node.innerText.trim() };
}"#;
